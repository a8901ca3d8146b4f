//! The only code path that writes into the media tree. The swap is a
//! rename chain on one filesystem, so every intermediate state leaves
//! either the original at `path` or a recoverable `path.bak`.

use crate::error::ReplaceError;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ReplaceOutcome {
    pub saved_bytes: u64,
    pub savings_percent: f64,
    /// Present when `testing_mode` kept the original around.
    pub backup_path: Option<PathBuf>,
}

pub fn backup_path_for(original: &Path) -> PathBuf {
    let mut os = original.as_os_str().to_owned();
    os.push(".bak");
    PathBuf::from(os)
}

/// Swap `candidate` into `original`'s place:
/// 1. reject unless the candidate clears the savings floor,
/// 2. `original` → `original.bak` (atomic),
/// 3. `candidate` → `original` (atomic),
/// 4. unlink the backup unless `testing_mode`,
/// rolling back the backup rename if step 3 fails.
pub fn safe_replace(
    original: &Path,
    candidate: &Path,
    min_savings_pct: f64,
    testing_mode: bool,
) -> Result<ReplaceOutcome, ReplaceError> {
    let original_size = std::fs::metadata(original)
        .map_err(|e| ReplaceError::BackupFailed {
            path: original.display().to_string(),
            message: format!("cannot stat original: {}", e),
        })?
        .len();
    let candidate_size = std::fs::metadata(candidate)
        .map_err(|e| ReplaceError::BackupFailed {
            path: candidate.display().to_string(),
            message: format!("cannot stat candidate: {}", e),
        })?
        .len();

    let ceiling = original_size as f64 * (1.0 - min_savings_pct / 100.0);
    if candidate_size == 0 || candidate_size as f64 > ceiling {
        return Err(ReplaceError::InsufficientSavings {
            output: candidate_size,
            source_size: original_size,
        });
    }

    let backup = backup_path_for(original);

    std::fs::rename(original, &backup).map_err(|e| ReplaceError::BackupFailed {
        path: original.display().to_string(),
        message: e.to_string(),
    })?;

    if let Err(swap_err) = std::fs::rename(candidate, original) {
        // The original is sitting at .bak; put it back.
        return match std::fs::rename(&backup, original) {
            Ok(()) => Err(ReplaceError::SwapFailed {
                path: original.display().to_string(),
                message: swap_err.to_string(),
            }),
            Err(rollback_err) => Err(ReplaceError::RollbackFailed {
                path: original.display().to_string(),
                backup: backup.display().to_string(),
                message: format!("swap: {}; rollback: {}", swap_err, rollback_err),
            }),
        };
    }

    let backup_kept = if testing_mode {
        info!("Testing mode: keeping backup at {:?}", backup);
        Some(backup)
    } else {
        if let Err(e) = std::fs::remove_file(&backup) {
            // Not fatal: the scanner recognizes .bak pairs and leaves them be.
            warn!("Failed to unlink backup {:?}: {}", backup, e);
        }
        None
    };

    let saved = original_size - candidate_size;
    Ok(ReplaceOutcome {
        saved_bytes: saved,
        savings_percent: saved as f64 / original_size as f64 * 100.0,
        backup_path: backup_kept,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_swap_removes_backup() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.mkv");
        let candidate = dir.path().join("a.crucible.mkv");
        std::fs::write(&original, vec![0u8; 1000]).unwrap();
        std::fs::write(&candidate, vec![1u8; 450]).unwrap();

        let outcome = safe_replace(&original, &candidate, 5.0, false).unwrap();
        assert_eq!(outcome.saved_bytes, 550);
        assert!((outcome.savings_percent - 55.0).abs() < 0.01);
        assert!(outcome.backup_path.is_none());

        assert_eq!(std::fs::read(&original).unwrap(), vec![1u8; 450]);
        assert!(!backup_path_for(&original).exists());
        assert!(!candidate.exists());
    }

    #[test]
    fn test_testing_mode_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.mkv");
        let candidate = dir.path().join("a.new");
        std::fs::write(&original, vec![0u8; 1000]).unwrap();
        std::fs::write(&candidate, vec![1u8; 450]).unwrap();

        let outcome = safe_replace(&original, &candidate, 5.0, true).unwrap();
        let backup = outcome.backup_path.expect("backup kept");
        assert_eq!(std::fs::read(&backup).unwrap(), vec![0u8; 1000]);
        assert_eq!(std::fs::read(&original).unwrap(), vec![1u8; 450]);
    }

    #[test]
    fn test_insufficient_savings_leaves_original_alone() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.mkv");
        let candidate = dir.path().join("a.new");
        std::fs::write(&original, vec![0u8; 1000]).unwrap();
        std::fs::write(&candidate, vec![1u8; 970]).unwrap();

        let err = safe_replace(&original, &candidate, 5.0, false).unwrap_err();
        assert!(matches!(err, ReplaceError::InsufficientSavings { .. }));
        assert_eq!(std::fs::read(&original).unwrap(), vec![0u8; 1000]);
        assert!(!backup_path_for(&original).exists());
    }

    #[test]
    fn test_missing_candidate_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.mkv");
        let candidate = dir.path().join("vanished.new");
        std::fs::write(&original, vec![0u8; 1000]).unwrap();

        let err = safe_replace(&original, &candidate, 5.0, false).unwrap_err();
        assert!(matches!(err, ReplaceError::BackupFailed { .. }));
        assert!(original.exists());
        assert!(!backup_path_for(&original).exists());
    }

    #[test]
    fn test_empty_candidate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.mkv");
        let candidate = dir.path().join("a.new");
        std::fs::write(&original, vec![0u8; 1000]).unwrap();
        std::fs::write(&candidate, b"").unwrap();

        let err = safe_replace(&original, &candidate, 5.0, false).unwrap_err();
        assert!(matches!(err, ReplaceError::InsufficientSavings { .. }));
    }
}

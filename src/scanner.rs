//! Media source feeding the queue. Directory walking is the default
//! implementation; anything that yields `(path, size, mtime)` records will
//! do.

use crate::error::Result;
use crate::store::{ScanOutcome, Store};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub added: u64,
    pub updated: u64,
}

pub struct Scanner {
    extensions: Vec<String>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self {
            extensions: vec![
                "mp4".to_string(),
                "mkv".to_string(),
                "mov".to_string(),
                "avi".to_string(),
                "m4v".to_string(),
                "webm".to_string(),
                "ts".to_string(),
            ],
        }
    }

    pub fn scan(&self, directories: &[PathBuf]) -> Vec<ScannedFile> {
        let mut files = Vec::new();

        for dir in directories {
            info!("Scanning directory: {:?}", dir);
            for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if !self.is_candidate(path) {
                    continue;
                }

                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                debug!("Found media file: {:?}", path);
                files.push(ScannedFile {
                    path: path.to_path_buf(),
                    size_bytes: metadata.len(),
                    mtime: unix_mtime(metadata.modified().unwrap_or(UNIX_EPOCH)),
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!("Found {} candidate media files", files.len());
        files
    }

    /// A `.bak` sibling means the path already went through safe-replace;
    /// the file at `path` is the transcoded output and must not be
    /// re-enqueued. The `.bak` itself is never a candidate.
    fn is_candidate(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
            return false;
        };
        if ext.eq_ignore_ascii_case("bak") {
            return false;
        }
        if !self.extensions.contains(&ext.to_lowercase()) {
            return false;
        }

        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        !Path::new(&backup).exists()
    }

    /// Walk the roots and reconcile with the store.
    pub async fn scan_into(&self, store: &Store, directories: &[PathBuf]) -> Result<ScanReport> {
        let files = self.scan(directories);
        let mut report = ScanReport::default();

        for file in files {
            let path = file.path.to_string_lossy();
            match store.upsert_scan(&path, file.size_bytes, file.mtime).await? {
                ScanOutcome::Added => report.added += 1,
                ScanOutcome::Updated => report.updated += 1,
                ScanOutcome::Unchanged => {}
            }
        }

        info!(
            "Scan finished: {} added, {} updated",
            report.added, report.updated
        );
        Ok(report)
    }
}

fn unix_mtime(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bak_files_are_never_candidates() {
        let scanner = Scanner::new();
        assert!(!scanner.is_candidate(Path::new("/tmp/nonexistent-dir/a.mkv.bak")));
        assert!(!scanner.is_candidate(Path::new("/tmp/nonexistent-dir/a.txt")));
        assert!(scanner.is_candidate(Path::new("/tmp/nonexistent-dir/a.mkv")));
    }

    #[test]
    fn test_scan_skips_replaced_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("movie.mkv");
        let backup = dir.path().join("movie.mkv.bak");
        let fresh = dir.path().join("fresh.mkv");
        std::fs::write(&original, b"new bytes").unwrap();
        std::fs::write(&backup, b"old bytes").unwrap();
        std::fs::write(&fresh, b"untouched").unwrap();

        let scanner = Scanner::new();
        let files = scanner.scan(&[dir.path().to_path_buf()]);
        let paths: Vec<_> = files.iter().map(|f| f.path.clone()).collect();

        assert_eq!(paths, vec![fresh]);
    }
}

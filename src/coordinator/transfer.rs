//! Byte movement between coordinator and workers: hashed source
//! downloads and resumable result uploads staged next to the target.

use crate::error::{Result, TransferError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

const HASH_BUF_SIZE: usize = 1024 * 1024;

/// Streaming SHA-256 of a whole file.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Open a file positioned at `offset` for range-resumed downloads.
pub async fn open_ranged(path: &Path, offset: u64) -> std::io::Result<(File, u64)> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = offset.min(len);
    file.seek(SeekFrom::Start(offset)).await?;
    Ok((file, len - offset))
}

/// Content hashes computed at assignment time, served back on the bytes
/// endpoint so workers can verify downloads without a second full read
/// on the coordinator.
#[derive(Default)]
pub struct SourceHashes {
    hashes: Mutex<HashMap<i64, String>>,
}

impl SourceHashes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_id: i64, hash: String) {
        if let Ok(mut map) = self.hashes.lock() {
            map.insert(file_id, hash);
        }
    }

    pub fn get(&self, file_id: i64) -> Option<String> {
        self.hashes.lock().ok().and_then(|map| map.get(&file_id).cloned())
    }

    pub fn remove(&self, file_id: i64) {
        if let Ok(mut map) = self.hashes.lock() {
            map.remove(&file_id);
        }
    }
}

#[derive(Debug, Clone)]
struct UploadSession {
    file_id: i64,
    lease_token: String,
    temp_path: PathBuf,
    expected_size: u64,
    expected_hash: String,
    bytes_written: u64,
}

#[derive(Debug)]
pub struct FinishedUpload {
    pub file_id: i64,
    pub lease_token: String,
    pub temp_path: PathBuf,
    pub size: u64,
}

#[derive(Debug)]
pub enum UploadProgress {
    /// More bytes expected; the worker continues from this offset.
    Incomplete { offset: u64 },
    /// All bytes landed and the hash checked out.
    Complete(FinishedUpload),
}

/// Result-upload bookkeeping. One session per live `(file_id, lease)`;
/// a worker that lost its connection resumes by asking for the offset.
#[derive(Default)]
pub struct Uploads {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl Uploads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue (or re-issue) an upload id. The staging file lives next to
    /// the target so the final rename stays on one filesystem.
    pub async fn begin(
        &self,
        file_id: i64,
        lease_token: &str,
        target: &Path,
        expected_size: u64,
        expected_hash: &str,
    ) -> Result<(String, u64)> {
        {
            let sessions = self.lock();
            if let Some((id, session)) = sessions
                .iter()
                .find(|(_, s)| s.file_id == file_id && s.lease_token == lease_token)
            {
                return Ok((id.clone(), session.bytes_written));
            }
        }

        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let filename = target
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());
        let temp_path = target
            .with_file_name(format!(".{}.upload-{}", filename, upload_id));

        File::create(&temp_path).await.map_err(|e| {
            TransferError::Io(format!("cannot stage upload at {:?}: {}", temp_path, e))
        })?;

        let session = UploadSession {
            file_id,
            lease_token: lease_token.to_string(),
            temp_path,
            expected_size,
            expected_hash: expected_hash.to_string(),
            bytes_written: 0,
        };
        self.lock().insert(upload_id.clone(), session);
        Ok((upload_id, 0))
    }

    /// Append a chunk at `offset`. Rewinds are allowed (a retry after a
    /// half-acknowledged chunk), gaps are not.
    pub async fn store_chunk<R>(
        &self,
        upload_id: &str,
        offset: u64,
        mut body: R,
    ) -> Result<UploadProgress>
    where
        R: AsyncRead + Unpin,
    {
        let session = self
            .lock()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| TransferError::Rejected(format!("unknown upload id {}", upload_id)))?;

        if offset > session.bytes_written {
            return Err(TransferError::Rejected(format!(
                "offset {} ahead of received {}",
                offset, session.bytes_written
            ))
            .into());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&session.temp_path)
            .await
            .map_err(|e| TransferError::Io(format!("staging file vanished: {}", e)))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;

        let copied = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| TransferError::Io(format!("write failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;

        let total = offset + copied;
        if total > session.expected_size {
            self.abort(upload_id).await;
            return Err(TransferError::Rejected(format!(
                "received {} bytes, expected {}",
                total, session.expected_size
            ))
            .into());
        }

        {
            let mut sessions = self.lock();
            if let Some(s) = sessions.get_mut(upload_id) {
                s.bytes_written = total;
            }
        }

        if total < session.expected_size {
            return Ok(UploadProgress::Incomplete { offset: total });
        }

        // Every byte landed; the hash is the last gate before safe-replace.
        let actual = hash_file(&session.temp_path)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        if actual != session.expected_hash {
            self.abort(upload_id).await;
            return Err(TransferError::HashMismatch {
                expected: session.expected_hash,
                actual,
            }
            .into());
        }

        self.lock().remove(upload_id);
        info!(
            "Upload {} complete for file {} ({} bytes)",
            upload_id, session.file_id, total
        );
        Ok(UploadProgress::Complete(FinishedUpload {
            file_id: session.file_id,
            lease_token: session.lease_token,
            temp_path: session.temp_path,
            size: total,
        }))
    }

    /// Drop a session and its staging file.
    pub async fn abort(&self, upload_id: &str) {
        let session = self.lock().remove(upload_id);
        if let Some(session) = session {
            if let Err(e) = tokio::fs::remove_file(&session.temp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove staging file {:?}: {}", session.temp_path, e);
                }
            }
        }
    }

    /// Drop every session tied to a lease (the assignment was reaped).
    pub async fn abort_for_lease(&self, lease_token: &str) {
        let ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.lease_token == lease_token)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.abort(&id).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UploadSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    #[tokio::test]
    async fn test_single_shot_upload() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");
        let data = b"encoded bytes".to_vec();

        let uploads = Uploads::new();
        let (id, offset) = uploads
            .begin(1, "lease-a", &target, data.len() as u64, &hash_of(&data))
            .await
            .unwrap();
        assert_eq!(offset, 0);

        let progress = uploads
            .store_chunk(&id, 0, data.as_slice())
            .await
            .unwrap();
        let UploadProgress::Complete(done) = progress else {
            panic!("expected complete");
        };
        assert_eq!(done.size, data.len() as u64);
        assert_eq!(std::fs::read(&done.temp_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_resume_continues_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");
        let data = b"0123456789".to_vec();

        let uploads = Uploads::new();
        let (id, _) = uploads
            .begin(1, "lease-a", &target, 10, &hash_of(&data))
            .await
            .unwrap();

        let progress = uploads.store_chunk(&id, 0, &data[..4]).await.unwrap();
        assert!(matches!(progress, UploadProgress::Incomplete { offset: 4 }));

        // Re-begin with the same lease resumes the same session.
        let (id2, offset) = uploads
            .begin(1, "lease-a", &target, 10, &hash_of(&data))
            .await
            .unwrap();
        assert_eq!(id2, id);
        assert_eq!(offset, 4);

        let progress = uploads.store_chunk(&id, 4, &data[4..]).await.unwrap();
        assert!(matches!(progress, UploadProgress::Complete(_)));
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejects_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");
        let data = b"encoded bytes".to_vec();

        let uploads = Uploads::new();
        let (id, _) = uploads
            .begin(1, "lease-a", &target, data.len() as u64, "not-the-hash")
            .await
            .unwrap();

        let err = uploads.store_chunk(&id, 0, data.as_slice()).await;
        assert!(err.is_err());
        // Session and staging file are gone; a fresh begin starts over.
        let (_, offset) = uploads
            .begin(1, "lease-a", &target, data.len() as u64, &hash_of(&data))
            .await
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_gap_offset_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("movie.mkv");

        let uploads = Uploads::new();
        let (id, _) = uploads.begin(1, "lease-a", &target, 10, "x").await.unwrap();
        let err = uploads.store_chunk(&id, 6, &b"zz"[..]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_hash_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

//! Typed client for the coordinator's RPC surface, with resume on both
//! transfer directions.

use crate::error::{CrucibleError, Result, TransferError};
use crate::protocol::{
    Assignment, HeartbeatRequest, HeartbeatResponse, NextResponse, ProgressReport,
    RegisterRequest, RegisterResponse, ReportRequest, ResultResponse, UploadOffset,
};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

const TRANSFER_ATTEMPTS: usize = 3;

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    worker_id: String,
}

impl Client {
    pub fn new(base_url: &str, worker_id: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        let resp = self
            .http
            .post(self.url("/workers/register"))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let resp = self
            .http
            .post(self.url(&format!("/workers/{}/heartbeat", self.worker_id)))
            .json(req)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CrucibleError::UnknownWorker(self.worker_id.clone()));
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn next(&self) -> Result<NextResponse> {
        let resp = self
            .http
            .post(self.url(&format!("/workers/{}/next", self.worker_id)))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    pub async fn progress(&self, file_id: i64, report: &ProgressReport) -> Result<()> {
        self.http
            .post(self.url(&format!("/files/{}/progress", file_id)))
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn report(&self, file_id: i64, req: &ReportRequest) -> Result<()> {
        self.http
            .post(self.url(&format!("/files/{}/report", file_id)))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Pull the source down to `dest`, resuming from whatever is already
    /// there, and verify the end-to-end hash before returning.
    pub async fn download(&self, assignment: &Assignment, dest: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once(assignment, dest).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TRANSFER_ATTEMPTS => {
                    warn!(
                        "Download of file {} failed (attempt {}): {}; resuming",
                        assignment.file_id, attempt, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(&self, assignment: &Assignment, dest: &Path) -> Result<()> {
        let offset = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.len() <= assignment.size_bytes => meta.len(),
            Ok(_) => {
                // Bigger than the source can ever be: start over.
                tokio::fs::remove_file(dest).await.ok();
                0
            }
            Err(_) => 0,
        };

        let resp = self
            .http
            .get(self.url(&format!("/files/{}/bytes", assignment.file_id)))
            .query(&[("offset", offset)])
            .header("x-lease-token", &assignment.lease_token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(CrucibleError::StaleLease {
                file_id: assignment.file_id,
            });
        }
        let resp = resp.error_for_status()?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(dest)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::Io(format!("read failed: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::Io(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        drop(file);

        let got = tokio::fs::metadata(dest)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if got != assignment.size_bytes {
            return Err(TransferError::ShortTransfer {
                expected: assignment.size_bytes,
                actual: got,
            }
            .into());
        }

        let actual = hash_local(dest).await?;
        if actual != assignment.content_hash {
            // Corrupt on the wire or on disk; resuming would keep the rot.
            tokio::fs::remove_file(dest).await.ok();
            return Err(TransferError::HashMismatch {
                expected: assignment.content_hash.clone(),
                actual,
            }
            .into());
        }

        info!(
            "Downloaded file {} ({} bytes, hash verified)",
            assignment.file_id, got
        );
        Ok(())
    }

    /// Push the encoded result up, resuming from the coordinator's offset
    /// after any interruption. Returns the coordinator's verdict.
    pub async fn upload(
        &self,
        assignment: &Assignment,
        output: &Path,
        output_size: u64,
        content_hash: &str,
    ) -> Result<ResultResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let begin: UploadOffset = {
                let resp = self
                    .http
                    .post(self.url(&format!("/files/{}/result/begin", assignment.file_id)))
                    .json(&serde_json::json!({
                        "lease_token": assignment.lease_token,
                        "output_size": output_size,
                        "content_hash": content_hash,
                    }))
                    .send()
                    .await?;
                if resp.status() == reqwest::StatusCode::CONFLICT {
                    return Err(CrucibleError::StaleLease {
                        file_id: assignment.file_id,
                    });
                }
                resp.error_for_status()?.json().await?
            };

            match self
                .upload_from(assignment, output, output_size, &begin.upload_id, begin.offset)
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if attempt < TRANSFER_ATTEMPTS => {
                    warn!(
                        "Upload of file {} failed (attempt {}): {}; resuming",
                        assignment.file_id, attempt, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_from(
        &self,
        assignment: &Assignment,
        output: &Path,
        output_size: u64,
        upload_id: &str,
        offset: u64,
    ) -> Result<ResultResponse> {
        let mut file = File::open(output)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;

        let resp = self
            .http
            .post(self.url(&format!(
                "/files/{}/result/{}",
                assignment.file_id, upload_id
            )))
            .query(&[("offset", offset)])
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(CrucibleError::StaleLease {
                file_id: assignment.file_id,
            });
        }
        let body: serde_json::Value = resp.error_for_status()?.json().await?;

        // The chunk endpoint answers with either a continuation offset or
        // the final verdict.
        if let Ok(result) = serde_json::from_value::<ResultResponse>(body.clone()) {
            return Ok(result);
        }
        let progress: UploadOffset = serde_json::from_value(body)
            .map_err(|e| TransferError::Rejected(format!("unrecognized upload reply: {}", e)))?;
        Err(TransferError::ShortTransfer {
            expected: output_size,
            actual: progress.offset,
        }
        .into())
    }
}

/// SHA-256 of a local file, used to verify downloads and stamp uploads.
pub async fn hash_local(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| TransferError::Io(e.to_string()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

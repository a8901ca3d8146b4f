//! Walks each file through its state machine. Every worker-originated
//! report lands here; the coordinator classifies what happened and decides
//! the transition, never the worker.

use crate::config::ClusterConfig;
use crate::coordinator::replace::{self, ReplaceOutcome};
use crate::coordinator::transfer::{FinishedUpload, Uploads};
use crate::error::{ReplaceError, Result};
use crate::events::{Event, EventBus};
use crate::coordinator::registry::Registry;
use crate::protocol::{FailureKind, Outcome, ProgressReport, ResultResponse, SkipReason};
use crate::store::{CompletionOutcome, FileStatus, Store};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// A `processing` file with no progress for this long is force-failed.
pub const PROGRESS_SILENCE_TIMEOUT_S: u64 = 300;

/// Retryability is a property of the failure kind, not of what the worker
/// claimed. `killed` goes back to pending: the abort was the operator's,
/// not the file's fault.
pub fn kind_is_retryable(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::TransferError
            | FailureKind::ProbeTimeout
            | FailureKind::EncoderCrash
            | FailureKind::WorkerOffline
            | FailureKind::StaleLease
            | FailureKind::Stalled
            | FailureKind::Killed
    )
}

pub struct Lifecycle {
    store: Arc<Store>,
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    uploads: Arc<Uploads>,
    cluster: ClusterConfig,
}

impl Lifecycle {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        events: Arc<EventBus>,
        uploads: Arc<Uploads>,
        cluster: ClusterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            uploads,
            cluster,
        }
    }

    /// Progress report from a worker. Stale leases are dropped silently
    /// (they belong to a reaped assignment) but leave an audit line.
    pub async fn handle_progress(&self, file_id: i64, report: &ProgressReport) -> Result<()> {
        let accepted = self
            .store
            .record_progress(file_id, &report.lease_token)
            .await?;
        if !accepted {
            info!(
                "Dropping progress for file {} with stale lease {}",
                file_id, report.lease_token
            );
            return Ok(());
        }

        if let Some(ref source) = report.source {
            self.store
                .record_source_profile(file_id, &report.lease_token, source)
                .await?;
        }

        if let Some(record) = self.store.get_file(file_id).await? {
            if let Some(worker_id) = record.assigned_worker_id.as_deref() {
                self.events.publish_progress(
                    file_id,
                    worker_id,
                    report.percent,
                    report.fps,
                    report.eta_seconds,
                    report.phase,
                );
            }
        }
        Ok(())
    }

    /// Terminal report from a worker.
    pub async fn handle_report(&self, file_id: i64, lease: &str, outcome: &Outcome) -> Result<()> {
        match outcome {
            Outcome::Success { .. } => {
                // Completion is recorded when the upload lands; a success
                // report is only a confirmation.
                match self.store.get_file(file_id).await? {
                    Some(record) if record.status == FileStatus::Completed => {}
                    _ => warn!(
                        "Success report for file {} without a completed upload; ignoring",
                        file_id
                    ),
                }
                Ok(())
            }
            Outcome::Failure { kind, message, .. } => {
                self.handle_failure(file_id, lease, *kind, message).await
            }
            Outcome::Skip { reason } => self.handle_worker_skip(file_id, lease, *reason).await,
        }
    }

    async fn handle_failure(
        &self,
        file_id: i64,
        lease: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<()> {
        let retryable = kind_is_retryable(kind);
        let record = self.store.get_file(file_id).await?;
        let worker_id = record.and_then(|r| r.assigned_worker_id);

        let new_status = self
            .store
            .record_failure(
                file_id,
                lease,
                kind,
                message,
                retryable,
                self.cluster.max_attempts,
            )
            .await?;

        let Some(status) = new_status else {
            info!(
                "Dropping failure report for file {} with stale lease ({})",
                file_id, kind
            );
            return Ok(());
        };

        self.uploads.abort_for_lease(lease).await;
        if let Some(ref worker_id) = worker_id {
            self.registry.record_failure(worker_id);
        }
        self.events.clear_progress_mark(file_id);
        self.events.publish(Event::FileChanged {
            file_id,
            status,
            reason: Some(format!("{}: {}", kind, message)),
        });
        info!("File {} failed ({}): now {}", file_id, kind, status);
        Ok(())
    }

    async fn handle_worker_skip(
        &self,
        file_id: i64,
        lease: &str,
        reason: SkipReason,
    ) -> Result<()> {
        let record = self.store.get_file(file_id).await?;
        let worker_id = record.and_then(|r| r.assigned_worker_id);

        let accepted = self.store.record_skip(file_id, Some(lease), reason).await?;
        if !accepted {
            info!(
                "Dropping skip report for file {} with stale lease ({})",
                file_id, reason
            );
            return Ok(());
        }

        if let Some(ref worker_id) = worker_id {
            self.registry.mark_idle(worker_id);
        }
        self.events.clear_progress_mark(file_id);
        self.events.publish(Event::FileChanged {
            file_id,
            status: FileStatus::Skipped,
            reason: Some(reason.to_string()),
        });
        info!("File {} skipped: {}", file_id, reason);
        Ok(())
    }

    /// A fully received, hash-verified upload. Runs safe-replace and
    /// records the outcome; this is the only path to `completed`.
    pub async fn complete_upload(&self, upload: FinishedUpload) -> Result<ResultResponse> {
        let Some(record) = self.store.get_file(upload.file_id).await? else {
            let _ = tokio::fs::remove_file(&upload.temp_path).await;
            return Ok(ResultResponse::Rejected {
                reason: "file record no longer exists".to_string(),
            });
        };

        if record.lease_token.as_deref() != Some(upload.lease_token.as_str()) {
            let _ = tokio::fs::remove_file(&upload.temp_path).await;
            info!(
                "Rejecting upload for file {} with stale lease",
                upload.file_id
            );
            return Ok(ResultResponse::Rejected {
                reason: "stale lease".to_string(),
            });
        }

        let original = Path::new(&record.path).to_path_buf();
        let temp = upload.temp_path.clone();
        let min_savings = self.cluster.min_savings_pct;
        let testing_mode = self.cluster.testing_mode;
        let replaced = tokio::task::spawn_blocking(move || {
            replace::safe_replace(&original, &temp, min_savings, testing_mode)
        })
        .await
        .map_err(|e| crate::error::CrucibleError::Internal(e.to_string()))?;

        match replaced {
            Ok(outcome) => {
                self.finish_completed(&record.path, upload.file_id, &upload.lease_token, &outcome)
                    .await?;
                if let Some(worker_id) = record.assigned_worker_id.as_deref() {
                    self.registry.record_success(worker_id, None);
                }
                Ok(ResultResponse::Accepted {
                    saved_bytes: outcome.saved_bytes,
                    savings_percent: outcome.savings_percent,
                })
            }
            Err(ReplaceError::InsufficientSavings {
                output,
                source_size: source,
            }) => {
                let _ = tokio::fs::remove_file(&upload.temp_path).await;
                let accepted = self
                    .store
                    .record_skip(
                        upload.file_id,
                        Some(&upload.lease_token),
                        SkipReason::OutputSmallerThanThreshold,
                    )
                    .await?;
                if accepted {
                    if let Some(worker_id) = record.assigned_worker_id.as_deref() {
                        self.registry.mark_idle(worker_id);
                    }
                    self.events.publish(Event::FileChanged {
                        file_id: upload.file_id,
                        status: FileStatus::Skipped,
                        reason: Some(SkipReason::OutputSmallerThanThreshold.to_string()),
                    });
                }
                info!(
                    "File {} output too large ({} of {} bytes); skipped",
                    upload.file_id, output, source
                );
                Ok(ResultResponse::Rejected {
                    reason: SkipReason::OutputSmallerThanThreshold.to_string(),
                })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&upload.temp_path).await;
                warn!(
                    "Safe-replace failed for file {}: {}",
                    upload.file_id, e
                );
                self.handle_failure(
                    upload.file_id,
                    &upload.lease_token,
                    FailureKind::SafeReplaceFailed,
                    &e.to_string(),
                )
                .await?;
                Ok(ResultResponse::Rejected {
                    reason: format!("safe replace failed: {}", e),
                })
            }
        }
    }

    async fn finish_completed(
        &self,
        path: &str,
        file_id: i64,
        lease: &str,
        outcome: &ReplaceOutcome,
    ) -> Result<()> {
        let output_size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        match self
            .store
            .record_completion(file_id, lease, output_size)
            .await?
        {
            CompletionOutcome::Recorded => {
                self.events.clear_progress_mark(file_id);
                self.events.publish(Event::FileChanged {
                    file_id,
                    status: FileStatus::Completed,
                    reason: None,
                });
                info!(
                    "File {} completed: saved {} bytes ({:.1}%)",
                    file_id, outcome.saved_bytes, outcome.savings_percent
                );
            }
            CompletionOutcome::Duplicate => {
                info!("Duplicate completion for file {}; no-op", file_id);
            }
            CompletionOutcome::StaleLease => {
                // The swap already happened; this should be unreachable
                // because the lease was checked before safe-replace.
                warn!(
                    "Completion for file {} hit a stale lease after replace",
                    file_id
                );
            }
        }
        Ok(())
    }

    /// Operator abort: ask the worker to stop via its next heartbeat. The
    /// record stays in flight until the worker acknowledges with
    /// `failure(kind=killed)` or the sweeper reaps it.
    pub async fn abort(&self, file_id: i64) -> Result<bool> {
        let Some(record) = self.store.get_file(file_id).await? else {
            return Ok(false);
        };
        let (Some(worker_id), Some(lease)) =
            (record.assigned_worker_id.as_deref(), record.lease_token.as_deref())
        else {
            return Ok(false);
        };
        let delivered = self.registry.request_cancel(worker_id, lease);
        info!(
            "Abort requested for file {} on worker {} (directive queued: {})",
            file_id, worker_id, delivered
        );
        Ok(delivered)
    }

    /// One sweep: reap assignments held by newly offline workers, then
    /// force-fail progress-silent jobs.
    pub async fn sweep(&self, newly_offline: &[String]) -> Result<()> {
        for worker_id in newly_offline {
            if let Some(record) = self.store.assignment_for(worker_id).await? {
                let lease = record.lease_token.clone().unwrap_or_default();
                if self.store.reap_assignment(record.id, worker_id).await? {
                    self.uploads.abort_for_lease(&lease).await;
                    self.events.clear_progress_mark(record.id);
                    self.events.publish(Event::FileChanged {
                        file_id: record.id,
                        status: FileStatus::Pending,
                        reason: Some(FailureKind::WorkerOffline.to_string()),
                    });
                    info!(
                        "Reaped file {} from offline worker {}",
                        record.id, worker_id
                    );
                }
            }
        }

        for record in self.store.find_stalled(PROGRESS_SILENCE_TIMEOUT_S).await? {
            let Some(lease) = record.lease_token.clone() else {
                continue;
            };
            self.handle_failure(
                record.id,
                &lease,
                FailureKind::Stalled,
                &format!(
                    "no progress for {}s",
                    PROGRESS_SILENCE_TIMEOUT_S
                ),
            )
            .await?;
        }

        Ok(())
    }

    // Operator surface.

    pub async fn operator_reset(&self, file_id: i64) -> Result<bool> {
        let done = self.store.reset(file_id).await?;
        if done {
            self.events.publish(Event::FileChanged {
                file_id,
                status: FileStatus::Pending,
                reason: Some("operator reset".to_string()),
            });
        }
        Ok(done)
    }

    pub async fn operator_skip(&self, file_id: i64) -> Result<bool> {
        let done = self
            .store
            .record_skip(file_id, None, SkipReason::OperatorSkip)
            .await?;
        if done {
            self.events.publish(Event::FileChanged {
                file_id,
                status: FileStatus::Skipped,
                reason: Some("operator skip".to_string()),
            });
        }
        Ok(done)
    }

    pub async fn operator_delete(&self, file_id: i64) -> Result<bool> {
        let done = self.store.delete(file_id).await?;
        if done {
            self.events.clear_progress_mark(file_id);
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(kind_is_retryable(FailureKind::TransferError));
        assert!(kind_is_retryable(FailureKind::EncoderCrash));
        assert!(kind_is_retryable(FailureKind::Stalled));
        assert!(kind_is_retryable(FailureKind::Killed));
        assert!(!kind_is_retryable(FailureKind::MalformedSource));
        assert!(!kind_is_retryable(FailureKind::DiskFull));
        assert!(!kind_is_retryable(FailureKind::SafeReplaceFailed));
    }
}

//! Picks the next file for a requesting worker. The claim itself is a
//! single atomic store update; everything here is eligibility and
//! packaging.

use crate::config::ClusterConfig;
use crate::coordinator::registry::Registry;
use crate::coordinator::transfer::{self, SourceHashes};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::protocol::{Assignment, AssignmentParams, FailureKind, NextResponse};
use crate::store::{FileStatus, Store};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Losing a claim race is cheap; trying forever is not.
const CLAIM_RETRIES: usize = 3;

pub struct Scheduler {
    store: Arc<Store>,
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    hashes: Arc<SourceHashes>,
    cluster: ClusterConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        events: Arc<EventBus>,
        hashes: Arc<SourceHashes>,
        cluster: ClusterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            hashes,
            cluster,
        }
    }

    pub async fn next_for(&self, worker_id: &str) -> Result<NextResponse> {
        if !self.registry.eligible_for_work(worker_id) {
            return Ok(NextResponse::NoWork);
        }

        // One slot per worker: a live assignment means no new work, even if
        // the worker lost track of it.
        if let Some(held) = self.store.assignment_for(worker_id).await? {
            info!(
                "Worker {} asked for work while holding file {}",
                worker_id, held.id
            );
            return Ok(NextResponse::NoWork);
        }

        for _ in 0..CLAIM_RETRIES {
            let Some(record) = self
                .store
                .claim_next(worker_id, self.cluster.file_order, self.cluster.pin_grace_s)
                .await?
            else {
                return Ok(NextResponse::NoWork);
            };

            let lease = record.lease_token.clone().unwrap_or_default();

            // Hash before handing out bytes so the worker can verify its
            // download end to end. An unreadable source fails here, not on
            // N workers.
            let content_hash = match transfer::hash_file(Path::new(&record.path)).await {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(
                        "Source {} unreadable while hashing: {}; failing file {}",
                        record.path, e, record.id
                    );
                    self.store
                        .record_failure(
                            record.id,
                            &lease,
                            FailureKind::TransferError,
                            &format!("source unreadable: {}", e),
                            true,
                            self.cluster.max_attempts,
                        )
                        .await?;
                    continue;
                }
            };

            self.hashes.insert(record.id, content_hash.clone());
            self.registry.mark_processing(worker_id, record.id);
            self.events.publish(Event::FileChanged {
                file_id: record.id,
                status: FileStatus::Assigned,
                reason: None,
            });
            info!(
                "Assigned file {} ({}) to worker {}",
                record.id, record.filename, worker_id
            );

            return Ok(NextResponse::Assignment(Assignment {
                file_id: record.id,
                path: record.path,
                size_bytes: record.size_bytes as u64,
                content_hash,
                lease_token: lease,
                params: AssignmentParams {
                    target_crf: record.target_crf.map(|v| v as u8),
                    target_audio_bitrate: record.target_audio_bitrate.map(|v| v as u32),
                    encoder_preset: self.cluster.encoder_preset,
                    skip_audio_transcode: self.cluster.skip_audio_transcode,
                },
            }));
        }

        Ok(NextResponse::NoWork)
    }
}

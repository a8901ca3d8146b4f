//! End-to-end coordinator scenarios without the HTTP layer: crash
//! recovery, stale leases, the savings floor, and operator aborts.

use crucible::config::{ClusterConfig, FileOrder};
use crucible::coordinator::lifecycle::Lifecycle;
use crucible::coordinator::registry::Registry;
use crucible::coordinator::transfer::{UploadProgress, Uploads};
use crucible::events::EventBus;
use crucible::protocol::{
    FailureKind, HeartbeatRequest, Outcome, SkipReason, WorkerCapabilities,
};
use crucible::store::{FileStatus, Store};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<Store>,
    registry: Arc<Registry>,
    events: Arc<EventBus>,
    uploads: Arc<Uploads>,
    lifecycle: Lifecycle,
}

async fn harness(testing_mode: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(&dir.path().join("test.db")).await.unwrap());
    let registry = Arc::new(Registry::new());
    let events = Arc::new(EventBus::new());
    let uploads = Arc::new(Uploads::new());
    let cluster = ClusterConfig {
        testing_mode,
        ..Default::default()
    };
    let lifecycle = Lifecycle::new(
        store.clone(),
        registry.clone(),
        events.clone(),
        uploads.clone(),
        cluster,
    );
    Harness {
        _dir: dir,
        store,
        registry,
        events,
        uploads,
        lifecycle,
    }
}

fn caps() -> WorkerCapabilities {
    WorkerCapabilities {
        cpu_count: 4,
        memory_total_mb: 8192,
        encoder_presets: vec![8],
        supports_file_distribution: true,
    }
}

fn hash_of(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Scenario: worker dies mid-encode; the sweeper reaps, a second worker
/// finishes the file, and the revived first worker's stale reports are
/// no-ops.
#[tokio::test]
async fn crashed_worker_is_reaped_and_its_reports_ignored() {
    let h = harness(false).await;
    h.registry.register("w1", "one", "h1", "0.1.0", caps(), &h.events);

    h.store.upsert_scan("/m/a.mkv", 1000, 10).await.unwrap();
    let claimed = h
        .store
        .claim_next("w1", FileOrder::Oldest, 60)
        .await
        .unwrap()
        .unwrap();
    let old_lease = claimed.lease_token.clone().unwrap();
    h.store.record_progress(claimed.id, &old_lease).await.unwrap();

    // w1 goes silent; the sweep flips it offline and reaps.
    let newly_offline = h
        .registry
        .sweep_offline(std::time::Duration::from_secs(0), &h.events);
    assert_eq!(newly_offline, vec!["w1".to_string()]);
    h.lifecycle.sweep(&newly_offline).await.unwrap();

    let record = h.store.get_file(claimed.id).await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Pending);
    assert_eq!(record.attempt_count, 1);

    // w2 picks it up with a fresh lease.
    let reclaimed = h
        .store
        .claim_next("w2", FileOrder::Oldest, 0)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(reclaimed.lease_token.as_deref(), Some(old_lease.as_str()));

    // The revived w1 posts a failure with its dead lease: dropped.
    h.lifecycle
        .handle_report(
            claimed.id,
            &old_lease,
            &Outcome::Failure {
                kind: FailureKind::EncoderCrash,
                message: "late report".into(),
                retryable: true,
            },
        )
        .await
        .unwrap();
    let record = h.store.get_file(claimed.id).await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Assigned);
    assert_eq!(record.assigned_worker_id.as_deref(), Some("w2"));
}

/// Scenario: the transcode saved only 3%; the upload is rejected, the file
/// is skipped, and the original is untouched with no backup left behind.
#[tokio::test]
async fn insufficient_savings_rejects_upload_and_skips() {
    let h = harness(false).await;

    let media = h._dir.path().join("media");
    std::fs::create_dir_all(&media).unwrap();
    let original = media.join("a.mkv");
    std::fs::write(&original, vec![0u8; 1000]).unwrap();

    let path = original.to_string_lossy().to_string();
    h.store.upsert_scan(&path, 1000, 10).await.unwrap();
    let claimed = h
        .store
        .claim_next("w1", FileOrder::Oldest, 60)
        .await
        .unwrap()
        .unwrap();
    let lease = claimed.lease_token.clone().unwrap();

    let output = vec![1u8; 970];
    let (upload_id, _) = h
        .uploads
        .begin(claimed.id, &lease, &original, 970, &hash_of(&output))
        .await
        .unwrap();
    let progress = h
        .uploads
        .store_chunk(&upload_id, 0, output.as_slice())
        .await
        .unwrap();
    let UploadProgress::Complete(finished) = progress else {
        panic!("expected complete upload");
    };

    let verdict = h.lifecycle.complete_upload(finished).await.unwrap();
    match verdict {
        crucible::protocol::ResultResponse::Rejected { reason } => {
            assert_eq!(reason, "output_smaller_than_threshold");
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let record = h.store.get_file(claimed.id).await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Skipped);
    assert_eq!(
        record.skip_reason.as_deref(),
        Some("output_smaller_than_threshold")
    );

    // Original bytes intact, no .bak, staging file gone.
    assert_eq!(std::fs::read(&original).unwrap(), vec![0u8; 1000]);
    assert!(!Path::new(&format!("{}.bak", path)).exists());
}

/// Scenario: happy path with testing mode on; the original survives as
/// `.bak` and the record carries the savings.
#[tokio::test]
async fn accepted_upload_completes_with_backup_in_testing_mode() {
    let h = harness(true).await;
    h.registry.register("w1", "one", "h1", "0.1.0", caps(), &h.events);

    let media = h._dir.path().join("media");
    std::fs::create_dir_all(&media).unwrap();
    let original = media.join("a.mkv");
    let original_bytes = vec![7u8; 2000];
    std::fs::write(&original, &original_bytes).unwrap();

    let path = original.to_string_lossy().to_string();
    h.store.upsert_scan(&path, 2000, 10).await.unwrap();
    let claimed = h
        .store
        .claim_next("w1", FileOrder::Oldest, 60)
        .await
        .unwrap()
        .unwrap();
    let lease = claimed.lease_token.clone().unwrap();

    let output = vec![9u8; 900];
    let (upload_id, _) = h
        .uploads
        .begin(claimed.id, &lease, &original, 900, &hash_of(&output))
        .await
        .unwrap();
    let UploadProgress::Complete(finished) = h
        .uploads
        .store_chunk(&upload_id, 0, output.as_slice())
        .await
        .unwrap()
    else {
        panic!("expected complete upload");
    };

    let verdict = h.lifecycle.complete_upload(finished).await.unwrap();
    match verdict {
        crucible::protocol::ResultResponse::Accepted {
            saved_bytes,
            savings_percent,
        } => {
            assert_eq!(saved_bytes, 1100);
            assert!((savings_percent - 55.0).abs() < 0.01);
        }
        other => panic!("expected acceptance, got {:?}", other),
    }

    // New bytes at the original path; the old bytes at .bak.
    assert_eq!(std::fs::read(&original).unwrap(), output);
    let backup = format!("{}.bak", path);
    assert_eq!(std::fs::read(&backup).unwrap(), original_bytes);

    let record = h.store.get_file(claimed.id).await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Completed);
    assert_eq!(record.output_size_bytes, Some(900));
    assert!(record.savings_percent.unwrap() >= 5.0);
}

/// Scenario: operator abort delivers a cancel directive on the next
/// heartbeat; the worker acknowledges with `killed` and the file requeues.
#[tokio::test]
async fn operator_abort_round_trip() {
    let h = harness(false).await;
    h.registry.register("w1", "one", "h1", "0.1.0", caps(), &h.events);

    h.store.upsert_scan("/m/a.mkv", 1000, 10).await.unwrap();
    let claimed = h
        .store
        .claim_next("w1", FileOrder::Oldest, 60)
        .await
        .unwrap()
        .unwrap();
    let lease = claimed.lease_token.clone().unwrap();

    assert!(h.lifecycle.abort(claimed.id).await.unwrap());

    let hb = HeartbeatRequest {
        cpu_percent: None,
        mem_percent: None,
        current: None,
    };
    let resp = h.registry.heartbeat("w1", &hb).unwrap();
    assert_eq!(resp.cancel.as_deref(), Some(lease.as_str()));

    // Worker acknowledges the kill.
    h.lifecycle
        .handle_report(
            claimed.id,
            &lease,
            &Outcome::Failure {
                kind: FailureKind::Killed,
                message: "operator abort".into(),
                retryable: true,
            },
        )
        .await
        .unwrap();

    let record = h.store.get_file(claimed.id).await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Pending);
    assert_eq!(record.attempt_count, 1);
}

/// Scenario: a worker's probe finds Dolby Vision; its skip report lands as
/// a terminal skip, never a failure.
#[tokio::test]
async fn dynamic_hdr_skip_report() {
    let h = harness(false).await;
    h.registry.register("w1", "one", "h1", "0.1.0", caps(), &h.events);

    h.store.upsert_scan("/m/dv.mkv", 1000, 10).await.unwrap();
    let claimed = h
        .store
        .claim_next("w1", FileOrder::Oldest, 60)
        .await
        .unwrap()
        .unwrap();
    let lease = claimed.lease_token.clone().unwrap();

    h.lifecycle
        .handle_report(
            claimed.id,
            &lease,
            &Outcome::Skip {
                reason: SkipReason::DynamicHdrUnpreservable,
            },
        )
        .await
        .unwrap();

    let record = h.store.get_file(claimed.id).await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::Skipped);
    assert_eq!(
        record.skip_reason.as_deref(),
        Some("dynamic_hdr_unpreservable")
    );
    assert_eq!(record.attempt_count, 1);
}

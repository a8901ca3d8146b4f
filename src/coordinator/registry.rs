//! In-memory worker registry. Workers are ephemeral: the map is rebuilt
//! from re-registrations after a coordinator restart, while the queue
//! itself lives in the store.

use crate::events::{Event, EventBus};
use crate::protocol::{CurrentJob, HeartbeatRequest, HeartbeatResponse, WorkerCapabilities};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Smoothing factor for the per-worker encode speed average.
const SPEED_EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Registering,
    Idle,
    Processing,
    Offline,
}

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: String,
    pub display_name: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub fade_out: bool,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub current: Option<CurrentJob>,
    /// Lease the operator wants cancelled; delivered on the next heartbeat.
    pub cancel_requested: Option<String>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub ewma_speed: Option<f64>,
}

/// Serializable view for `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub id: String,
    pub display_name: String,
    pub hostname: String,
    pub version: String,
    pub status: WorkerStatus,
    pub fade_out: bool,
    pub last_heartbeat_at: DateTime<Utc>,
    pub current: Option<CurrentJob>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub ewma_speed: Option<f64>,
}

pub struct Registry {
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent by worker id; re-registration refreshes the record and
    /// revives an offline entry.
    pub fn register(
        &self,
        id: &str,
        display_name: &str,
        host: &str,
        version: &str,
        capabilities: WorkerCapabilities,
        events: &EventBus,
    ) {
        let mut workers = self.lock();
        let fresh = !workers.contains_key(id);
        let entry = workers.entry(id.to_string()).or_insert_with(|| WorkerEntry {
            id: id.to_string(),
            display_name: display_name.to_string(),
            hostname: host.to_string(),
            version: version.to_string(),
            capabilities: capabilities.clone(),
            status: WorkerStatus::Registering,
            fade_out: false,
            last_heartbeat: Instant::now(),
            last_heartbeat_at: Utc::now(),
            current: None,
            cancel_requested: None,
            jobs_completed: 0,
            jobs_failed: 0,
            ewma_speed: None,
        });

        entry.display_name = display_name.to_string();
        entry.hostname = host.to_string();
        entry.version = version.to_string();
        entry.capabilities = capabilities;
        entry.status = WorkerStatus::Idle;
        entry.last_heartbeat = Instant::now();
        entry.last_heartbeat_at = Utc::now();

        if fresh {
            events.publish(Event::WorkerRegistered {
                worker_id: id.to_string(),
                display_name: display_name.to_string(),
            });
        }
    }

    /// Refresh liveness and telemetry; hand back any pending cancellation
    /// directive along with the fade-out flag.
    pub fn heartbeat(
        &self,
        id: &str,
        telemetry: &HeartbeatRequest,
    ) -> Option<HeartbeatResponse> {
        let mut workers = self.lock();
        let entry = workers.get_mut(id)?;

        entry.last_heartbeat = Instant::now();
        entry.last_heartbeat_at = Utc::now();
        entry.current = telemetry.current.clone();
        if entry.status == WorkerStatus::Offline || entry.status == WorkerStatus::Registering {
            entry.status = if entry.current.is_some() {
                WorkerStatus::Processing
            } else {
                WorkerStatus::Idle
            };
        }

        let cancel = entry.cancel_requested.take();
        Some(HeartbeatResponse {
            cancel,
            fade_out: entry.fade_out,
        })
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Scheduler-facing gate: only a known, live, non-fading worker with
    /// distribution support gets work.
    pub fn eligible_for_work(&self, id: &str) -> bool {
        let workers = self.lock();
        match workers.get(id) {
            Some(w) => {
                !w.fade_out
                    && w.status != WorkerStatus::Offline
                    && w.capabilities.supports_file_distribution
            }
            None => false,
        }
    }

    pub fn mark_processing(&self, id: &str, file_id: i64) {
        if let Some(w) = self.lock().get_mut(id) {
            w.status = WorkerStatus::Processing;
            w.current = Some(CurrentJob {
                file_id,
                percent: 0.0,
                fps: 0.0,
                eta_seconds: None,
                phase: crate::protocol::Phase::Downloading,
            });
        }
    }

    pub fn mark_idle(&self, id: &str) {
        if let Some(w) = self.lock().get_mut(id) {
            if w.status != WorkerStatus::Offline {
                w.status = WorkerStatus::Idle;
            }
            w.current = None;
        }
    }

    pub fn request_cancel(&self, id: &str, lease_token: &str) -> bool {
        match self.lock().get_mut(id) {
            Some(w) => {
                w.cancel_requested = Some(lease_token.to_string());
                true
            }
            None => false,
        }
    }

    pub fn set_fade_out(&self, id: &str, fade_out: bool, events: &EventBus) -> Option<bool> {
        let mut workers = self.lock();
        let w = workers.get_mut(id)?;
        if w.fade_out != fade_out {
            w.fade_out = fade_out;
            events.publish(Event::WorkerFadeOut {
                worker_id: id.to_string(),
                fade_out,
            });
        }
        Some(w.fade_out)
    }

    pub fn record_success(&self, id: &str, encode_speed: Option<f64>) {
        if let Some(w) = self.lock().get_mut(id) {
            w.jobs_completed += 1;
            w.current = None;
            if w.status == WorkerStatus::Processing {
                w.status = WorkerStatus::Idle;
            }
            if let Some(speed) = encode_speed {
                w.ewma_speed = Some(match w.ewma_speed {
                    Some(prev) => SPEED_EWMA_ALPHA * speed + (1.0 - SPEED_EWMA_ALPHA) * prev,
                    None => speed,
                });
            }
        }
    }

    pub fn record_failure(&self, id: &str) {
        if let Some(w) = self.lock().get_mut(id) {
            w.jobs_failed += 1;
            w.current = None;
            if w.status == WorkerStatus::Processing {
                w.status = WorkerStatus::Idle;
            }
        }
    }

    /// Flip workers past the liveness timeout to offline, returning the
    /// ones that just transitioned so the sweeper can reap their
    /// assignments.
    pub fn sweep_offline(&self, liveness_timeout: Duration, events: &EventBus) -> Vec<String> {
        let mut newly_offline = Vec::new();
        let mut workers = self.lock();
        for (id, w) in workers.iter_mut() {
            if w.status != WorkerStatus::Offline
                && w.last_heartbeat.elapsed() > liveness_timeout
            {
                w.status = WorkerStatus::Offline;
                w.current = None;
                newly_offline.push(id.clone());
                events.publish(Event::WorkerOffline {
                    worker_id: id.clone(),
                });
            }
        }
        newly_offline
    }

    pub fn views(&self) -> Vec<WorkerView> {
        let workers = self.lock();
        let mut views: Vec<WorkerView> = workers
            .values()
            .map(|w| WorkerView {
                id: w.id.clone(),
                display_name: w.display_name.clone(),
                hostname: w.hostname.clone(),
                version: w.version.clone(),
                status: w.status,
                fade_out: w.fade_out,
                last_heartbeat_at: w.last_heartbeat_at,
                current: w.current.clone(),
                jobs_completed: w.jobs_completed,
                jobs_failed: w.jobs_failed,
                ewma_speed: w.ewma_speed,
            })
            .collect();
        views.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        views
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerEntry>> {
        match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> WorkerCapabilities {
        WorkerCapabilities {
            cpu_count: 8,
            memory_total_mb: 16384,
            encoder_presets: vec![6, 8, 10],
            supports_file_distribution: true,
        }
    }

    fn register(registry: &Registry, events: &EventBus, id: &str) {
        registry.register(id, id, "host", "0.1.0", caps(), events);
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();
        let events = EventBus::new();
        register(&registry, &events, "w1");
        register(&registry, &events, "w1");
        assert_eq!(registry.views().len(), 1);
        assert!(registry.eligible_for_work("w1"));
    }

    #[test]
    fn test_fade_out_blocks_work() {
        let registry = Registry::new();
        let events = EventBus::new();
        register(&registry, &events, "w1");
        registry.set_fade_out("w1", true, &events);
        assert!(!registry.eligible_for_work("w1"));
        registry.set_fade_out("w1", false, &events);
        assert!(registry.eligible_for_work("w1"));
    }

    #[test]
    fn test_cancel_directive_delivered_once() {
        let registry = Registry::new();
        let events = EventBus::new();
        register(&registry, &events, "w1");
        assert!(registry.request_cancel("w1", "lease-x"));

        let hb = HeartbeatRequest {
            cpu_percent: None,
            mem_percent: None,
            current: None,
        };
        let first = registry.heartbeat("w1", &hb).unwrap();
        assert_eq!(first.cancel.as_deref(), Some("lease-x"));
        let second = registry.heartbeat("w1", &hb).unwrap();
        assert_eq!(second.cancel, None);
    }

    #[test]
    fn test_sweep_marks_silent_workers_offline() {
        let registry = Registry::new();
        let events = EventBus::new();
        register(&registry, &events, "w1");

        // A zero timeout makes every worker stale immediately.
        let offline = registry.sweep_offline(Duration::from_secs(0), &events);
        assert_eq!(offline, vec!["w1".to_string()]);
        assert!(!registry.eligible_for_work("w1"));

        // Already-offline workers are not reported twice.
        let again = registry.sweep_offline(Duration::from_secs(0), &events);
        assert!(again.is_empty());

        // A heartbeat revives the worker.
        let hb = HeartbeatRequest {
            cpu_percent: None,
            mem_percent: None,
            current: None,
        };
        registry.heartbeat("w1", &hb);
        assert!(registry.eligible_for_work("w1"));
    }

    #[test]
    fn test_ewma_speed_smooths() {
        let registry = Registry::new();
        let events = EventBus::new();
        register(&registry, &events, "w1");
        registry.record_success("w1", Some(10.0));
        registry.record_success("w1", Some(20.0));
        let views = registry.views();
        let speed = views[0].ewma_speed.unwrap();
        assert!(speed > 10.0 && speed < 20.0);
    }

    #[test]
    fn test_unknown_worker_heartbeat_rejected() {
        let registry = Registry::new();
        let hb = HeartbeatRequest {
            cpu_percent: None,
            mem_percent: None,
            current: None,
        };
        assert!(registry.heartbeat("ghost", &hb).is_none());
    }
}

use crate::protocol::Phase;
use crate::store::FileStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Slow subscribers lag out past this backlog and must resubscribe.
pub const EVENT_BACKLOG: usize = 1000;

/// Progress ticks per file are throttled to at most five per second.
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    FileChanged {
        file_id: i64,
        status: FileStatus,
        reason: Option<String>,
    },
    Progress {
        file_id: i64,
        worker_id: String,
        percent: f64,
        fps: f64,
        eta_seconds: Option<u64>,
        phase: Phase,
    },
    WorkerRegistered {
        worker_id: String,
        display_name: String,
    },
    WorkerOffline {
        worker_id: String,
    },
    WorkerFadeOut {
        worker_id: String,
        fade_out: bool,
    },
    ScanFinished {
        added: u64,
        updated: u64,
    },
}

/// In-memory fan-out to UI subscribers. Publishing never blocks: the
/// channel is bounded and laggards are dropped by the receiver side.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    progress_marks: Mutex<HashMap<i64, Instant>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BACKLOG);
        Self {
            tx,
            progress_marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Rate-limited publish for progress ticks. Returns false if the tick
    /// was swallowed by the limiter.
    pub fn publish_progress(
        &self,
        file_id: i64,
        worker_id: &str,
        percent: f64,
        fps: f64,
        eta_seconds: Option<u64>,
        phase: Phase,
    ) -> bool {
        {
            let mut marks = match self.progress_marks.lock() {
                Ok(marks) => marks,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            if let Some(last) = marks.get(&file_id) {
                if now.duration_since(*last) < PROGRESS_MIN_INTERVAL {
                    return false;
                }
            }
            marks.insert(file_id, now);
        }

        self.publish(Event::Progress {
            file_id,
            worker_id: worker_id.to_string(),
            percent,
            fps,
            eta_seconds,
            phase,
        });
        true
    }

    /// Forget the limiter mark once a file reaches a terminal state.
    pub fn clear_progress_mark(&self, file_id: i64) {
        if let Ok(mut marks) = self.progress_marks.lock() {
            marks.remove(&file_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rate_limit() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();

        assert!(bus.publish_progress(1, "w1", 10.0, 24.0, None, Phase::Transcoding));
        // Immediately after, the limiter swallows the tick.
        assert!(!bus.publish_progress(1, "w1", 10.5, 24.0, None, Phase::Transcoding));
        // A different file is unaffected.
        assert!(bus.publish_progress(2, "w1", 1.0, 24.0, None, Phase::Transcoding));
    }
}

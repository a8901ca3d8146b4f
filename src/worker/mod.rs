//! The worker agent: one assignment at a time, everything local, all
//! results streamed back to the coordinator. The agent never writes into
//! shared storage.

pub mod client;

use crate::config::{ClusterConfig, WorkerConfig};
use crate::error::{CrucibleError, ProbeError, Result, TranscodeError};
use crate::media::policy::{self, Decision};
use crate::media::probe::{Probe, SourceProfile};
use crate::media::transcoder::Transcoder;
use crate::protocol::{
    Assignment, CurrentJob, FailureKind, HeartbeatRequest, NextResponse, Outcome, Phase,
    ProgressReport, RegisterRequest, ReportRequest, ResultResponse, SourceSummary,
    WorkerCapabilities,
};
use client::Client;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const REGISTER_BACKOFF: Duration = Duration::from_secs(5);
/// Progress posts to the coordinator during an encode, at most one per
/// this interval (the coordinator throttles fan-out separately).
const PROGRESS_POST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct ActiveJob {
    file_id: i64,
    lease_token: String,
    cancel: CancellationToken,
    current: CurrentJob,
}

pub struct WorkerAgent {
    config: WorkerConfig,
    client: Arc<Client>,
    cluster: Mutex<ClusterConfig>,
    active: Arc<Mutex<Option<ActiveJob>>>,
    fading_out: Arc<AtomicBool>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let worker_id = config.worker_id();
        let client = Arc::new(Client::new(&config.coordinator_url, &worker_id)?);
        Ok(Self {
            config,
            client,
            cluster: Mutex::new(ClusterConfig::default()),
            active: Arc::new(Mutex::new(None)),
            fading_out: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn run(self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;

        self.register_until_accepted().await;
        self.spawn_heartbeat();

        info!(
            "Worker {} ({}) online; polling {}",
            self.client.worker_id(),
            self.config.display_name(),
            self.config.coordinator_url
        );

        loop {
            if self.fading_out.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(self.config.idle_poll_s)).await;
                continue;
            }

            match self.client.next().await {
                Ok(NextResponse::Assignment(assignment)) => {
                    if let Err(e) = self.process(assignment).await {
                        error!("Assignment processing error: {}", e);
                    }
                    self.clear_active();
                }
                Ok(NextResponse::NoWork) => {
                    tokio::time::sleep(Duration::from_secs(self.config.idle_poll_s)).await;
                }
                Err(e) => {
                    warn!("Work poll failed: {}; re-registering", e);
                    self.register_until_accepted().await;
                }
            }
        }
    }

    fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            cpu_count: num_cpus::get(),
            memory_total_mb: total_memory_mb(),
            encoder_presets: (1..=13).collect(),
            supports_file_distribution: true,
        }
    }

    async fn register_until_accepted(&self) {
        loop {
            let req = RegisterRequest {
                worker_id: self.client.worker_id().to_string(),
                display_name: self.config.display_name(),
                hostname: hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                capabilities: self.capabilities(),
            };
            match self.client.register(&req).await {
                Ok(resp) if resp.accepted => {
                    info!(
                        "Registered with coordinator (config digest {})",
                        resp.config_digest
                    );
                    if let Ok(mut cluster) = self.cluster.lock() {
                        *cluster = resp.cluster_config;
                    }
                    return;
                }
                Ok(_) => warn!("Coordinator refused registration; retrying"),
                Err(e) => warn!("Registration failed: {}; retrying", e),
            }
            tokio::time::sleep(REGISTER_BACKOFF).await;
        }
    }

    fn spawn_heartbeat(&self) {
        let client = self.client.clone();
        let active = self.active.clone();
        let fading_out = self.fading_out.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let current = active
                    .lock()
                    .ok()
                    .and_then(|guard| guard.as_ref().map(|job| job.current.clone()));
                let req = HeartbeatRequest {
                    cpu_percent: None,
                    mem_percent: None,
                    current,
                };

                match client.heartbeat(&req).await {
                    Ok(resp) => {
                        if fading_out.swap(resp.fade_out, Ordering::SeqCst) != resp.fade_out {
                            info!("Fade-out is now {}", resp.fade_out);
                        }
                        if let Some(cancel_lease) = resp.cancel {
                            if let Ok(guard) = active.lock() {
                                if let Some(job) = guard.as_ref() {
                                    if job.lease_token == cancel_lease {
                                        info!(
                                            "Cancellation directive for file {}; stopping encoder",
                                            job.file_id
                                        );
                                        job.cancel.cancel();
                                    }
                                }
                            }
                        }
                    }
                    Err(CrucibleError::UnknownWorker(_)) => {
                        // Coordinator restarted; the work loop re-registers
                        // on its next poll.
                        warn!("Coordinator no longer knows us");
                    }
                    Err(e) => warn!("Heartbeat failed: {}", e),
                }
            }
        });
    }

    fn set_active(&self, assignment: &Assignment, cancel: CancellationToken) {
        if let Ok(mut guard) = self.active.lock() {
            *guard = Some(ActiveJob {
                file_id: assignment.file_id,
                lease_token: assignment.lease_token.clone(),
                cancel,
                current: CurrentJob {
                    file_id: assignment.file_id,
                    percent: 0.0,
                    fps: 0.0,
                    eta_seconds: None,
                    phase: Phase::Downloading,
                },
            });
        }
    }

    fn update_active(&self, percent: f64, fps: f64, eta_seconds: Option<u64>, phase: Phase) {
        if let Ok(mut guard) = self.active.lock() {
            if let Some(job) = guard.as_mut() {
                job.current = CurrentJob {
                    file_id: job.file_id,
                    percent,
                    fps,
                    eta_seconds,
                    phase,
                };
            }
        }
    }

    fn clear_active(&self) {
        if let Ok(mut guard) = self.active.lock() {
            *guard = None;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.active
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|job| job.cancel.is_cancelled()))
            .unwrap_or(false)
    }

    async fn post_progress(
        &self,
        assignment: &Assignment,
        percent: f64,
        fps: f64,
        eta_seconds: Option<u64>,
        phase: Phase,
        source: Option<SourceSummary>,
    ) {
        self.update_active(percent, fps, eta_seconds, phase);
        let report = ProgressReport {
            lease_token: assignment.lease_token.clone(),
            percent,
            fps,
            eta_seconds,
            phase,
            message: None,
            source,
        };
        if let Err(e) = self.client.progress(assignment.file_id, &report).await {
            warn!("Progress post failed: {}", e);
        }
    }

    async fn report_failure(
        &self,
        assignment: &Assignment,
        kind: FailureKind,
        message: String,
        retryable: bool,
    ) {
        let req = ReportRequest {
            lease_token: assignment.lease_token.clone(),
            outcome: Outcome::Failure {
                kind,
                message,
                retryable,
            },
        };
        if let Err(e) = self.client.report(assignment.file_id, &req).await {
            error!("Failure report failed: {}", e);
        }
    }

    async fn process(&self, assignment: Assignment) -> Result<()> {
        info!(
            "Processing file {} ({} bytes): {}",
            assignment.file_id, assignment.size_bytes, assignment.path
        );

        let cancel = CancellationToken::new();
        self.set_active(&assignment, cancel.clone());

        let extension = Path::new(&assignment.path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv")
            .to_string();
        let src = self
            .config
            .temp_dir
            .join(format!("src-{}.{}", assignment.file_id, extension));
        let out = self
            .config
            .temp_dir
            .join(format!("out-{}.mkv", assignment.file_id));

        let result = self
            .process_inner(&assignment, &cancel, &src, &out)
            .await;

        for path in [&src, &out] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to clean up {:?}: {}", path, e);
                }
            }
        }

        result
    }

    async fn process_inner(
        &self,
        assignment: &Assignment,
        cancel: &CancellationToken,
        src: &Path,
        out: &Path,
    ) -> Result<()> {
        // Phase 1: pull the source down.
        self.post_progress(assignment, 0.0, 0.0, None, Phase::Downloading, None)
            .await;
        if let Err(e) = self.client.download(assignment, src).await {
            self.report_failure(
                assignment,
                FailureKind::TransferError,
                e.to_string(),
                true,
            )
            .await;
            return Ok(());
        }

        if self.is_cancelled() {
            self.report_failure(
                assignment,
                FailureKind::Killed,
                "cancelled before encode".to_string(),
                true,
            )
            .await;
            return Ok(());
        }

        // Phase 2: probe locally and let the policy decide.
        let profile = match Probe::run(src).await {
            Ok(profile) => profile,
            Err(e) => {
                let (kind, retryable) = classify_probe_error(&e);
                self.report_failure(assignment, kind, e.to_string(), retryable)
                    .await;
                return Ok(());
            }
        };

        let cluster = self
            .cluster
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        let decision = policy::decide(&profile, &cluster);

        let summary = source_summary(&profile, &decision);
        self.post_progress(
            assignment,
            0.0,
            0.0,
            None,
            Phase::Probing,
            Some(summary),
        )
        .await;

        let params = match decision {
            Decision::Skip { reason, detail } => {
                info!(
                    "Skipping file {}: {} ({})",
                    assignment.file_id, reason, detail
                );
                let req = ReportRequest {
                    lease_token: assignment.lease_token.clone(),
                    outcome: Outcome::Skip { reason },
                };
                self.client.report(assignment.file_id, &req).await?;
                return Ok(());
            }
            Decision::Encode(params) => params,
        };

        // Phase 3: encode with live progress.
        let started = Instant::now();
        let (progress_tx, progress_rx) = mpsc::channel(16);
        let forwarder = self.spawn_progress_forwarder(assignment.clone(), progress_rx);

        let transcode =
            Transcoder::run(src, out, &params, &profile, cancel.clone(), progress_tx).await;
        forwarder.await.ok();

        let output = match transcode {
            Ok(output) => output,
            Err(e) => {
                let (kind, retryable) = classify_transcode_error(&e);
                self.report_failure(assignment, kind, e.to_string(), retryable)
                    .await;
                return Ok(());
            }
        };

        // Phase 4: stamp and upload.
        self.post_progress(assignment, 100.0, 0.0, None, Phase::Verifying, None)
            .await;
        let content_hash = client::hash_local(out).await?;

        self.post_progress(assignment, 0.0, 0.0, None, Phase::Uploading, None)
            .await;
        let verdict = self
            .client
            .upload(assignment, out, output.output_size, &content_hash)
            .await;

        match verdict {
            Ok(ResultResponse::Accepted {
                saved_bytes,
                savings_percent,
            }) => {
                let encode_speed = if started.elapsed().as_secs_f64() > 0.0 {
                    Some(profile.duration_secs / started.elapsed().as_secs_f64())
                } else {
                    None
                };
                info!(
                    "File {} accepted: saved {} bytes ({:.1}%)",
                    assignment.file_id, saved_bytes, savings_percent
                );
                let req = ReportRequest {
                    lease_token: assignment.lease_token.clone(),
                    outcome: Outcome::Success {
                        output_size_bytes: output.output_size,
                        encode_speed,
                    },
                };
                self.client.report(assignment.file_id, &req).await?;
            }
            Ok(ResultResponse::Rejected { reason }) => {
                // The coordinator already recorded the terminal state
                // (insufficient savings, replace failure); nothing to add.
                info!("File {} rejected by coordinator: {}", assignment.file_id, reason);
            }
            Err(e) => {
                self.report_failure(
                    assignment,
                    FailureKind::TransferError,
                    e.to_string(),
                    true,
                )
                .await;
            }
        }

        Ok(())
    }

    fn spawn_progress_forwarder(
        &self,
        assignment: Assignment,
        mut rx: mpsc::Receiver<crate::media::transcoder::TranscodeProgress>,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let mut last_post: Option<Instant> = None;
            while let Some(tick) = rx.recv().await {
                if let Ok(mut guard) = active.lock() {
                    if let Some(job) = guard.as_mut() {
                        job.current = CurrentJob {
                            file_id: job.file_id,
                            percent: tick.percent,
                            fps: tick.fps,
                            eta_seconds: tick.eta_seconds,
                            phase: Phase::Transcoding,
                        };
                    }
                }

                if last_post.is_some_and(|t| t.elapsed() < PROGRESS_POST_INTERVAL) {
                    continue;
                }
                last_post = Some(Instant::now());

                let report = ProgressReport {
                    lease_token: assignment.lease_token.clone(),
                    percent: tick.percent,
                    fps: tick.fps,
                    eta_seconds: tick.eta_seconds,
                    phase: Phase::Transcoding,
                    message: None,
                    source: None,
                };
                if let Err(e) = client.progress(assignment.file_id, &report).await {
                    warn!("Progress post failed: {}", e);
                }
            }
        })
    }
}

fn source_summary(profile: &SourceProfile, decision: &Decision) -> SourceSummary {
    let (target_crf, target_audio_bitrate) = match decision {
        Decision::Encode(params) => (
            Some(params.crf),
            params.audio_bitrates.first().copied(),
        ),
        Decision::Skip { .. } => (None, None),
    };
    SourceSummary {
        container: profile.container.clone(),
        video_codec: profile.video_codec.clone().unwrap_or_default(),
        width: profile.width,
        height: profile.height,
        video_bitrate_bps: profile.measured_bitrate(),
        audio_codec: profile.audio_streams.first().map(|a| a.codec.clone()),
        hdr_kind: profile.hdr_kind(),
        target_crf,
        target_audio_bitrate,
    }
}

fn classify_probe_error(e: &ProbeError) -> (FailureKind, bool) {
    match e {
        ProbeError::Timeout(_) => (FailureKind::ProbeTimeout, true),
        ProbeError::Unreadable(_) | ProbeError::Malformed(_) => {
            (FailureKind::MalformedSource, false)
        }
    }
}

fn classify_transcode_error(e: &TranscodeError) -> (FailureKind, bool) {
    match e {
        TranscodeError::Killed => (FailureKind::Killed, true),
        TranscodeError::EncoderCrash { .. } | TranscodeError::EmptyOutput => {
            (FailureKind::EncoderCrash, true)
        }
        TranscodeError::Io(message) if message.contains("No space") => {
            (FailureKind::DiskFull, false)
        }
        TranscodeError::Io(_) => (FailureKind::EncoderCrash, true),
    }
}

#[cfg(target_os = "linux")]
fn total_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|contents| {
            contents
                .lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
                .map(|kb| kb / 1024)
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn total_memory_mb() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_classification() {
        let (kind, retryable) = classify_probe_error(&ProbeError::Timeout(30));
        assert_eq!(kind, FailureKind::ProbeTimeout);
        assert!(retryable);

        let (kind, retryable) = classify_probe_error(&ProbeError::Malformed("x".into()));
        assert_eq!(kind, FailureKind::MalformedSource);
        assert!(!retryable);
    }

    #[test]
    fn test_transcode_error_classification() {
        let (kind, retryable) = classify_transcode_error(&TranscodeError::Killed);
        assert_eq!(kind, FailureKind::Killed);
        assert!(retryable);

        let (kind, retryable) = classify_transcode_error(&TranscodeError::Io(
            "No space left on device".into(),
        ));
        assert_eq!(kind, FailureKind::DiskFull);
        assert!(!retryable);
    }
}

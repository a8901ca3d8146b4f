//! Wire types shared by the coordinator's RPC surface and the worker agent.
//!
//! Every request a worker sends after claiming a file carries the
//! assignment's lease token; the coordinator rejects or drops anything with
//! a lease it no longer recognizes.

use crate::config::ClusterConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub cpu_count: usize,
    pub memory_total_mb: u64,
    pub encoder_presets: Vec<u8>,
    pub supports_file_distribution: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub worker_id: String,
    pub display_name: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: WorkerCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    pub config_digest: String,
    pub cluster_config: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub cpu_percent: Option<f64>,
    pub mem_percent: Option<f64>,
    pub current: Option<CurrentJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentJob {
    pub file_id: i64,
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: Option<u64>,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Lease of the assignment the operator aborted, if any. The worker
    /// kills its encoder and acknowledges with `failure(kind=killed)`.
    pub cancel: Option<String>,
    pub fade_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Downloading,
    Probing,
    Transcoding,
    Uploading,
    Verifying,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Probing => "probing",
            Self::Transcoding => "transcoding",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Encode targets the coordinator already knows for this file, if a prior
/// attempt recorded them. The worker recomputes policy locally either way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentParams {
    pub target_crf: Option<u8>,
    pub target_audio_bitrate: Option<u32>,
    pub encoder_preset: u8,
    pub skip_audio_transcode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub file_id: i64,
    pub path: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub lease_token: String,
    pub params: AssignmentParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextResponse {
    Assignment(Assignment),
    NoWork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdrKind {
    None,
    Hdr10,
    Hdr10Plus,
    DolbyVision,
    Unknown,
}

impl HdrKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Hdr10 => "hdr10",
            Self::Hdr10Plus => "hdr10plus",
            Self::DolbyVision => "dolby_vision",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "hdr10" => Self::Hdr10,
            "hdr10plus" => Self::Hdr10Plus,
            "dolby_vision" => Self::DolbyVision,
            "unknown" => Self::Unknown,
            _ => Self::None,
        }
    }

    /// Dynamic HDR metadata cannot be carried through the encoder.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Hdr10Plus | Self::DolbyVision)
    }
}

/// What the worker learned from probing, attached to the first
/// `progress{phase=probing}` report so the coordinator can persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub container: String,
    pub video_codec: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_bps: Option<u64>,
    pub audio_codec: Option<String>,
    pub hdr_kind: HdrKind,
    pub target_crf: Option<u8>,
    pub target_audio_bitrate: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub lease_token: String,
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: Option<u64>,
    pub phase: Phase,
    pub message: Option<String>,
    /// Present only on the first probing-phase report.
    pub source: Option<SourceSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransferError,
    ProbeTimeout,
    EncoderCrash,
    WorkerOffline,
    StaleLease,
    Stalled,
    Killed,
    MalformedSource,
    DiskFull,
    SafeReplaceFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransferError => "transfer_error",
            Self::ProbeTimeout => "probe_timeout",
            Self::EncoderCrash => "encoder_crash",
            Self::WorkerOffline => "worker_offline",
            Self::StaleLease => "stale_lease",
            Self::Stalled => "stalled",
            Self::Killed => "killed",
            Self::MalformedSource => "malformed_source",
            Self::DiskFull => "disk_full",
            Self::SafeReplaceFailed => "safe_replace_failed",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DynamicHdrUnpreservable,
    AlreadyEfficient,
    NonVideo,
    OutputSmallerThanThreshold,
    OperatorSkip,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DynamicHdrUnpreservable => "dynamic_hdr_unpreservable",
            Self::AlreadyEfficient => "already_efficient",
            Self::NonVideo => "non_video",
            Self::OutputSmallerThanThreshold => "output_smaller_than_threshold",
            Self::OperatorSkip => "operator_skip",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The worker reports what happened; the coordinator decides the state
/// transition. Nothing in here is trusted beyond the lease check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        output_size_bytes: u64,
        encode_speed: Option<f64>,
    },
    Failure {
        kind: FailureKind,
        message: String,
        retryable: bool,
    },
    Skip {
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub lease_token: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultResponse {
    Accepted {
        saved_bytes: u64,
        savings_percent: f64,
    },
    Rejected {
        reason: String,
    },
}

/// First response to a result upload: where to continue writing from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOffset {
    pub upload_id: String,
    pub offset: u64,
}

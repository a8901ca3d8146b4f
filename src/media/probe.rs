use crate::error::ProbeError;
use crate::protocol::HdrKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT_S: u64 = 30;

/// Raw ffprobe JSON model. Only the entries we ask for.
#[derive(Debug, Serialize, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<Stream>,
    pub format: Format,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Stream {
    pub codec_name: Option<String>,
    pub codec_type: String,
    pub pix_fmt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub coded_width: Option<u32>,
    pub coded_height: Option<u32>,
    pub bit_rate: Option<String>,
    pub bits_per_raw_sample: Option<String>,
    pub channels: Option<u32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub duration: Option<String>,
    pub color_primaries: Option<String>,
    pub color_transfer: Option<String>,
    pub color_space: Option<String>,
    #[serde(default)]
    pub side_data_list: Vec<SideData>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SideData {
    pub side_data_type: Option<String>,
    pub dv_profile: Option<u8>,
    pub max_luminance: Option<serde_json::Value>,
    pub min_luminance: Option<serde_json::Value>,
    pub max_content: Option<u32>,
    pub max_average: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Format {
    pub format_name: String,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub bit_rate: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameProbe {
    #[serde(default)]
    frames: Vec<Frame>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioStream {
    pub codec: String,
    pub channels: u32,
    pub bitrate_bps: Option<u64>,
}

/// Everything the quality policy needs to know about a source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProfile {
    pub container: String,
    pub video_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub bit_depth: Option<u8>,
    pub fps: f64,
    pub duration_secs: f64,
    pub total_frames: Option<u64>,
    pub size_bytes: u64,
    pub video_bitrate_bps: Option<u64>,
    pub container_bitrate_bps: Option<u64>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    pub mastering_display: bool,
    pub content_light_level: Option<(u32, u32)>,
    pub dolby_vision_profile: Option<u8>,
    pub hdr10plus_present: bool,
    pub audio_streams: Vec<AudioStream>,
    pub subtitle_count: u32,
}

impl SourceProfile {
    /// The bitrate the policy reasons about: the video stream's if known,
    /// the container's otherwise.
    pub fn measured_bitrate(&self) -> Option<u64> {
        self.video_bitrate_bps.or(self.container_bitrate_bps)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// HDR classification, evaluated in order of specificity.
    pub fn hdr_kind(&self) -> HdrKind {
        if self.dolby_vision_profile.is_some() {
            return HdrKind::DolbyVision;
        }
        if self.hdr10plus_present {
            return HdrKind::Hdr10Plus;
        }
        let pq_or_hlg = matches!(
            self.color_transfer.as_deref(),
            Some("smpte2084") | Some("arib-std-b67")
        );
        if pq_or_hlg || self.mastering_display {
            return HdrKind::Hdr10;
        }
        HdrKind::None
    }
}

pub struct Probe;

impl Probe {
    /// Inspect a local file. Failures are retryable once, then the file
    /// goes to `failed`.
    pub async fn run(path: &Path) -> Result<SourceProfile, ProbeError> {
        let raw = Self::ffprobe_streams(path).await?;
        let mut profile = Self::build_profile(&raw)?;

        // Dynamic HDR metadata only shows up on frames; one extra probe of
        // the first frame, and only when the stream already looks HDR.
        if profile.hdr_kind() == HdrKind::Hdr10 && profile.dolby_vision_profile.is_none() {
            profile.hdr10plus_present = Self::first_frame_has_hdr10plus(path).await?;
        }

        Ok(profile)
    }

    async fn ffprobe_streams(path: &Path) -> Result<FfprobeOutput, ProbeError> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                // Full stream output so side_data_list (Dolby Vision /
                // mastering display / CLL) comes along.
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output();

        let output = tokio::time::timeout(Duration::from_secs(PROBE_TIMEOUT_S), output)
            .await
            .map_err(|_| ProbeError::Timeout(PROBE_TIMEOUT_S))?
            .map_err(|e| ProbeError::Unreadable(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Unreadable(format!("ffprobe failed: {}", err)));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ProbeError::Malformed(format!("bad ffprobe JSON: {}", e)))
    }

    async fn first_frame_has_hdr10plus(path: &Path) -> Result<bool, ProbeError> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-select_streams",
                "v:0",
                "-read_intervals",
                "%+#4",
                "-show_frames",
            ])
            .arg(path)
            .output();

        let output = tokio::time::timeout(Duration::from_secs(PROBE_TIMEOUT_S), output)
            .await
            .map_err(|_| ProbeError::Timeout(PROBE_TIMEOUT_S))?
            .map_err(|e| ProbeError::Unreadable(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            // Frame probing is best effort; an unreadable tail does not
            // change the stream-level classification.
            return Ok(false);
        }

        let frames: FrameProbe = serde_json::from_slice(&output.stdout)
            .map_err(|e| ProbeError::Malformed(format!("bad frame JSON: {}", e)))?;

        Ok(frames.frames.iter().any(|f| {
            f.side_data_list.iter().any(|sd| {
                sd.side_data_type
                    .as_deref()
                    .is_some_and(|t| t.contains("SMPTE2094-40") || t.contains("HDR10+"))
            })
        }))
    }

    fn build_profile(raw: &FfprobeOutput) -> Result<SourceProfile, ProbeError> {
        let video = select_video_stream(&raw.streams);

        let audio_streams: Vec<AudioStream> = raw
            .streams
            .iter()
            .filter(|s| s.codec_type == "audio")
            .map(|s| AudioStream {
                codec: s.codec_name.clone().unwrap_or_default(),
                channels: s.channels.unwrap_or(2),
                bitrate_bps: s.bit_rate.as_deref().and_then(parse_u64),
            })
            .collect();

        let subtitle_count = raw
            .streams
            .iter()
            .filter(|s| s.codec_type == "subtitle")
            .count() as u32;

        let (fps, duration_secs, total_frames) = match video {
            Some(v) => video_timing(v, &raw.format),
            None => (0.0, 0.0, None),
        };

        let mut dolby_vision_profile = None;
        let mut mastering_display = false;
        let mut content_light_level = None;
        if let Some(v) = video {
            for sd in &v.side_data_list {
                match sd.side_data_type.as_deref() {
                    Some(t) if t.contains("DOVI") => {
                        dolby_vision_profile = sd.dv_profile.or(Some(0));
                    }
                    Some(t) if t.contains("Mastering display") => mastering_display = true,
                    Some(t) if t.contains("Content light level") => {
                        content_light_level =
                            Some((sd.max_content.unwrap_or(0), sd.max_average.unwrap_or(0)));
                    }
                    _ => {}
                }
            }
        }

        Ok(SourceProfile {
            container: raw.format.format_name.clone(),
            video_codec: video.and_then(|v| v.codec_name.clone()),
            width: video.and_then(|v| v.width.or(v.coded_width)).unwrap_or(0),
            height: video.and_then(|v| v.height.or(v.coded_height)).unwrap_or(0),
            bit_depth: video.and_then(infer_bit_depth),
            fps,
            duration_secs,
            total_frames,
            size_bytes: raw
                .format
                .size
                .as_deref()
                .and_then(parse_u64)
                .unwrap_or(0),
            video_bitrate_bps: video.and_then(|v| v.bit_rate.as_deref()).and_then(parse_u64),
            container_bitrate_bps: raw.format.bit_rate.as_deref().and_then(parse_u64),
            color_transfer: video.and_then(|v| v.color_transfer.clone()),
            color_primaries: video.and_then(|v| v.color_primaries.clone()),
            color_space: video.and_then(|v| v.color_space.clone()),
            mastering_display,
            content_light_level,
            dolby_vision_profile,
            hdr10plus_present: false,
            audio_streams,
            subtitle_count,
        })
    }
}

fn video_timing(video: &Stream, format: &Format) -> (f64, f64, Option<u64>) {
    let fps = parse_fps(
        video
            .avg_frame_rate
            .as_deref()
            .or(video.r_frame_rate.as_deref())
            .unwrap_or(""),
    )
    .unwrap_or(0.0);

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(parse_f64)
        .or_else(|| video.duration.as_deref().and_then(parse_f64))
        .unwrap_or(0.0);

    let total_frames = video
        .nb_frames
        .as_deref()
        .and_then(parse_u64)
        .or_else(|| {
            if fps > 0.0 && duration_secs > 0.0 {
                Some((fps * duration_secs) as u64)
            } else {
                None
            }
        });

    (fps, duration_secs, total_frames)
}

fn select_video_stream(streams: &[Stream]) -> Option<&Stream> {
    let mut best: Option<&Stream> = None;
    let mut best_pixels = 0u64;

    for stream in streams.iter().filter(|s| s.codec_type == "video") {
        // Cover art shows up as a video stream; a real one has a frame rate.
        if parse_fps(stream.avg_frame_rate.as_deref().unwrap_or("")).unwrap_or(0.0) <= 0.0
            && best.is_some()
        {
            continue;
        }
        let width = stream.width.or(stream.coded_width).unwrap_or(0) as u64;
        let height = stream.height.or(stream.coded_height).unwrap_or(0) as u64;
        let pixels = width.saturating_mul(height);
        if best.is_none() || pixels > best_pixels {
            best = Some(stream);
            best_pixels = pixels;
        }
    }

    best
}

pub fn parse_fps(s: &str) -> Option<f64> {
    if s.contains('/') {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() == 2 {
            let num: f64 = parts[0].parse().ok()?;
            let den: f64 = parts[1].parse().ok()?;
            if den == 0.0 {
                return None;
            }
            return Some(num / den);
        }
    }
    s.parse().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
    s.parse().ok()
}

fn parse_u64(s: &str) -> Option<u64> {
    s.parse().ok()
}

fn infer_bit_depth(stream: &Stream) -> Option<u8> {
    if let Some(ref pix_fmt) = stream.pix_fmt {
        let fmt = pix_fmt.to_ascii_lowercase();
        let depth_candidates = [
            (16u8, ["p16", "p016", "16le", "16be"]),
            (12u8, ["p12", "p012", "12le", "12be"]),
            (10u8, ["p10", "p010", "10le", "10be"]),
        ];
        for (depth, patterns) in depth_candidates.iter() {
            if patterns.iter().any(|pattern| fmt.contains(pattern)) {
                return Some(*depth);
            }
        }
        if fmt.starts_with("yuv") && !fmt.contains("le") && !fmt.contains("be") {
            return Some(8);
        }
    }

    stream
        .bits_per_raw_sample
        .as_deref()
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SourceProfile {
        SourceProfile {
            container: "matroska,webm".into(),
            video_codec: Some("hevc".into()),
            width: 3840,
            height: 2160,
            bit_depth: Some(10),
            fps: 23.976,
            duration_secs: 7200.0,
            total_frames: Some(172_627),
            size_bytes: 20_000_000_000,
            video_bitrate_bps: Some(18_000_000),
            container_bitrate_bps: Some(19_000_000),
            color_transfer: None,
            color_primaries: None,
            color_space: None,
            mastering_display: false,
            content_light_level: None,
            dolby_vision_profile: None,
            hdr10plus_present: false,
            audio_streams: vec![],
            subtitle_count: 0,
        }
    }

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("24/1"), Some(24.0));
        assert_eq!(parse_fps("23.976"), Some(23.976));
        assert_eq!(parse_fps("60000/1001"), Some(60000.0 / 1001.0));
        assert_eq!(parse_fps("invalid"), None);
        assert_eq!(parse_fps("24/0"), None);
    }

    #[test]
    fn test_hdr_classification_order() {
        let mut p = profile();
        assert_eq!(p.hdr_kind(), HdrKind::None);

        p.color_transfer = Some("smpte2084".into());
        assert_eq!(p.hdr_kind(), HdrKind::Hdr10);

        p.hdr10plus_present = true;
        assert_eq!(p.hdr_kind(), HdrKind::Hdr10Plus);

        // Dolby Vision wins over everything else.
        p.dolby_vision_profile = Some(5);
        assert_eq!(p.hdr_kind(), HdrKind::DolbyVision);
    }

    #[test]
    fn test_mastering_display_alone_means_hdr10() {
        let mut p = profile();
        p.mastering_display = true;
        assert_eq!(p.hdr_kind(), HdrKind::Hdr10);
    }

    #[test]
    fn test_hlg_is_hdr10_bucket() {
        let mut p = profile();
        p.color_transfer = Some("arib-std-b67".into());
        assert_eq!(p.hdr_kind(), HdrKind::Hdr10);
    }

    #[test]
    fn test_measured_bitrate_prefers_video_stream() {
        let p = profile();
        assert_eq!(p.measured_bitrate(), Some(18_000_000));

        let mut p2 = profile();
        p2.video_bitrate_bps = None;
        assert_eq!(p2.measured_bitrate(), Some(19_000_000));
    }
}

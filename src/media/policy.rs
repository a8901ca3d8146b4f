//! Pure quality policy: a `SourceProfile` goes in, encode parameters or a
//! skip verdict come out. No I/O, no clock, no configuration reads beyond
//! the cluster settings passed in.

use crate::config::ClusterConfig;
use crate::media::probe::SourceProfile;
use crate::protocol::SkipReason;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionBucket {
    Sd,
    Hd720,
    Hd1080,
    Qhd1440,
    Uhd4k,
}

impl ResolutionBucket {
    /// Bucket by pixel count so ultra-wide sources land where their area
    /// says, not where their width says.
    pub fn from_pixels(pixels: u64) -> Self {
        if pixels < 720 * 720 {
            Self::Sd
        } else if pixels < 1280 * 1280 {
            Self::Hd720
        } else if pixels < 1920 * 1920 {
            Self::Hd1080
        } else if pixels < 2560 * 2560 {
            Self::Qhd1440
        } else {
            Self::Uhd4k
        }
    }

    fn default_crf(&self) -> u8 {
        match self {
            Self::Sd => 30,
            Self::Hd720 => 29,
            Self::Hd1080 => 28,
            Self::Qhd1440 => 27,
            Self::Uhd4k => 26,
        }
    }

    /// Nominal AV1 bitrate this bucket's default CRF tends to produce.
    /// Used for the already-efficient check on AV1 sources.
    fn predicted_bitrate_bps(&self) -> u64 {
        match self {
            Self::Sd => 1_200_000,
            Self::Hd720 => 2_500_000,
            Self::Hd1080 => 4_500_000,
            Self::Qhd1440 => 8_000_000,
            Self::Uhd4k => 14_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitrateBucket {
    Low,
    Medium,
    High,
}

fn bitrate_bucket(bucket: ResolutionBucket, measured: Option<u64>) -> BitrateBucket {
    let Some(measured) = measured else {
        return BitrateBucket::Medium;
    };
    let nominal = bucket.predicted_bitrate_bps();
    if measured < nominal / 2 {
        BitrateBucket::Low
    } else if measured > nominal * 3 {
        BitrateBucket::High
    } else {
        BitrateBucket::Medium
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColorParams {
    pub primaries: String,
    pub transfer: String,
    pub space: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeParams {
    pub crf: u8,
    pub preset: u8,
    pub pixel_format: String,
    /// Set for HDR10 passthrough, absent for SDR.
    pub color: Option<ColorParams>,
    pub attach_hdr_side_data: bool,
    /// Target Opus bitrate per source audio stream, in order.
    pub audio_bitrates: Vec<u32>,
    pub skip_audio_transcode: bool,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Encode(EncodeParams),
    Skip { reason: SkipReason, detail: String },
}

pub fn decide(profile: &SourceProfile, cluster: &ClusterConfig) -> Decision {
    let Some(codec) = profile.video_codec.as_deref() else {
        return Decision::Skip {
            reason: SkipReason::NonVideo,
            detail: "no video stream in container".to_string(),
        };
    };

    let hdr = profile.hdr_kind();
    if hdr.is_dynamic() {
        return Decision::Skip {
            reason: SkipReason::DynamicHdrUnpreservable,
            detail: format!("{} metadata cannot be carried through the encoder", hdr.as_str()),
        };
    }

    let bucket = ResolutionBucket::from_pixels(profile.pixel_count());
    let crf = crf_for(bucket, codec, bitrate_bucket(bucket, profile.measured_bitrate()));

    if codec == "av1" {
        if let Some(measured) = profile.measured_bitrate() {
            let predicted = bucket.predicted_bitrate_bps();
            // Within 10% of what we'd produce anyway: leave it alone.
            if measured <= predicted + predicted / 10 {
                return Decision::Skip {
                    reason: SkipReason::AlreadyEfficient,
                    detail: format!(
                        "AV1 at {} bps vs predicted {} bps",
                        measured, predicted
                    ),
                };
            }
        }
    }

    let is_hdr10 = hdr == crate::protocol::HdrKind::Hdr10;
    let ten_bit = is_hdr10 || profile.bit_depth.unwrap_or(8) >= 10;

    Decision::Encode(EncodeParams {
        crf,
        preset: cluster.encoder_preset,
        pixel_format: if ten_bit { "yuv420p10le" } else { "yuv420p" }.to_string(),
        color: is_hdr10.then(|| ColorParams {
            primaries: "bt2020".to_string(),
            transfer: "smpte2084".to_string(),
            space: "bt2020nc".to_string(),
        }),
        attach_hdr_side_data: is_hdr10
            && (profile.mastering_display || profile.content_light_level.is_some()),
        audio_bitrates: profile
            .audio_streams
            .iter()
            .map(|a| audio_bitrate_for(&a.codec, a.channels, a.bitrate_bps))
            .collect(),
        skip_audio_transcode: cluster.skip_audio_transcode,
    })
}

/// Layered CRF lookup: specific `(bucket, codec, bitrate)` entries first,
/// then the bucket default.
fn crf_for(bucket: ResolutionBucket, codec: &str, bitrate: BitrateBucket) -> u8 {
    use BitrateBucket::*;
    use ResolutionBucket::*;

    match (bucket, codec, bitrate) {
        // Starved sources get nothing from a generous CRF.
        (_, _, Low) => bucket.default_crf().saturating_add(2),
        // High-bitrate h264 is the classic remux case; spend a little more.
        (Hd1080, "h264", High) => 26,
        (Uhd4k, "h264", High) => 24,
        (_, "h264", High) => bucket.default_crf().saturating_sub(1),
        // Modern codecs at high bitrates are already dense.
        (_, "hevc", High) | (_, "vp9", High) => bucket.default_crf().saturating_sub(1),
        _ => bucket.default_crf(),
    }
}

/// Per-stream Opus bitrate keyed by source codec, channel count, and
/// measured bitrate, with a channel-count default.
fn audio_bitrate_for(codec: &str, channels: u32, bitrate_bps: Option<u64>) -> u32 {
    let default = match channels {
        0 | 1 => 64_000,
        2 => 128_000,
        3..=5 => 192_000,
        6 | 7 => 256_000,
        _ => 320_000,
    };

    match codec {
        // Lossless sources always get the full channel budget.
        "truehd" | "flac" | "pcm_s16le" | "pcm_s24le" | "dts" => default,
        // Never inflate an already-lean lossy stream.
        _ => match bitrate_bps {
            Some(bps) if (bps as u32) < default => bps as u32,
            _ => default,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::probe::AudioStream;
    use crate::protocol::HdrKind;

    fn profile_1080p_h264() -> SourceProfile {
        SourceProfile {
            container: "matroska,webm".into(),
            video_codec: Some("h264".into()),
            width: 1920,
            height: 1080,
            bit_depth: Some(8),
            fps: 23.976,
            duration_secs: 5400.0,
            total_frames: Some(129_470),
            size_bytes: 2_000_000_000,
            video_bitrate_bps: Some(10_000_000),
            container_bitrate_bps: Some(10_500_000),
            color_transfer: Some("bt709".into()),
            color_primaries: Some("bt709".into()),
            color_space: Some("bt709".into()),
            mastering_display: false,
            content_light_level: None,
            dolby_vision_profile: None,
            hdr10plus_present: false,
            audio_streams: vec![AudioStream {
                codec: "ac3".into(),
                channels: 6,
                bitrate_bps: Some(640_000),
            }],
            subtitle_count: 2,
        }
    }

    #[test]
    fn test_resolution_buckets_by_pixel_count() {
        assert_eq!(ResolutionBucket::from_pixels(640 * 480), ResolutionBucket::Sd);
        assert_eq!(ResolutionBucket::from_pixels(1280 * 720), ResolutionBucket::Hd720);
        assert_eq!(ResolutionBucket::from_pixels(1920 * 1080), ResolutionBucket::Hd1080);
        assert_eq!(ResolutionBucket::from_pixels(2560 * 1440), ResolutionBucket::Qhd1440);
        assert_eq!(ResolutionBucket::from_pixels(3840 * 2160), ResolutionBucket::Uhd4k);
        // Ultra-wide 1080p-class: 2560x1080 has fewer pixels than 1920^2.
        assert_eq!(ResolutionBucket::from_pixels(2560 * 1080), ResolutionBucket::Hd1080);
    }

    #[test]
    fn test_sdr_1080p_encode() {
        let decision = decide(&profile_1080p_h264(), &ClusterConfig::default());
        let Decision::Encode(params) = decision else {
            panic!("expected encode decision");
        };
        assert_eq!(params.pixel_format, "yuv420p");
        assert!(params.color.is_none());
        assert_eq!(params.audio_bitrates, vec![256_000]);
    }

    #[test]
    fn test_dynamic_hdr_skips() {
        let mut p = profile_1080p_h264();
        p.dolby_vision_profile = Some(5);
        let decision = decide(&p, &ClusterConfig::default());
        let Decision::Skip { reason, .. } = decision else {
            panic!("expected skip");
        };
        assert_eq!(reason, SkipReason::DynamicHdrUnpreservable);
    }

    #[test]
    fn test_hdr10_gets_color_passthrough() {
        let mut p = profile_1080p_h264();
        p.width = 3840;
        p.height = 2160;
        p.bit_depth = Some(10);
        p.color_transfer = Some("smpte2084".into());
        p.mastering_display = true;
        assert_eq!(p.hdr_kind(), HdrKind::Hdr10);

        let Decision::Encode(params) = decide(&p, &ClusterConfig::default()) else {
            panic!("expected encode");
        };
        assert_eq!(params.pixel_format, "yuv420p10le");
        let color = params.color.expect("color params");
        assert_eq!(color.primaries, "bt2020");
        assert_eq!(color.transfer, "smpte2084");
        assert_eq!(color.space, "bt2020nc");
        assert!(params.attach_hdr_side_data);
    }

    #[test]
    fn test_efficient_av1_skips() {
        let mut p = profile_1080p_h264();
        p.video_codec = Some("av1".into());
        p.video_bitrate_bps = Some(4_600_000); // within 10% of 4.5 Mbps
        let Decision::Skip { reason, .. } = decide(&p, &ClusterConfig::default()) else {
            panic!("expected skip");
        };
        assert_eq!(reason, SkipReason::AlreadyEfficient);
    }

    #[test]
    fn test_fat_av1_still_reencodes() {
        let mut p = profile_1080p_h264();
        p.video_codec = Some("av1".into());
        p.video_bitrate_bps = Some(12_000_000);
        assert!(matches!(
            decide(&p, &ClusterConfig::default()),
            Decision::Encode(_)
        ));
    }

    #[test]
    fn test_no_video_stream_skips() {
        let mut p = profile_1080p_h264();
        p.video_codec = None;
        let Decision::Skip { reason, .. } = decide(&p, &ClusterConfig::default()) else {
            panic!("expected skip");
        };
        assert_eq!(reason, SkipReason::NonVideo);
    }

    #[test]
    fn test_audio_bitrate_never_inflates_lossy() {
        assert_eq!(audio_bitrate_for("aac", 2, Some(96_000)), 96_000);
        assert_eq!(audio_bitrate_for("aac", 2, Some(320_000)), 128_000);
        assert_eq!(audio_bitrate_for("truehd", 8, Some(3_000_000)), 320_000);
        assert_eq!(audio_bitrate_for("opus", 1, None), 64_000);
    }

    #[test]
    fn test_starved_source_gets_higher_crf() {
        let mut p = profile_1080p_h264();
        p.video_bitrate_bps = Some(1_000_000); // far below 1080p nominal
        let Decision::Encode(params) = decide(&p, &ClusterConfig::default()) else {
            panic!("expected encode");
        };
        assert_eq!(params.crf, 30);
    }
}

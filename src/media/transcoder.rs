use crate::error::TranscodeError;
use crate::media::policy::EncodeParams;
use crate::media::probe::SourceProfile;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a politely stopped encoder gets before the hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct TranscodeProgress {
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct TranscodeOutput {
    pub output_path: PathBuf,
    pub output_size: u64,
}

pub struct Transcoder;

impl Transcoder {
    /// Run the encoder over a local source. Progress ticks go out on the
    /// channel at roughly the encoder's own reporting rate; the token
    /// cancels politely first, then hard.
    pub async fn run(
        input: &Path,
        output: &Path,
        params: &EncodeParams,
        profile: &SourceProfile,
        cancel: CancellationToken,
        progress_tx: mpsc::Sender<TranscodeProgress>,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let mut cmd = build_command(input, output, params);
        info!("Executing encoder: {:?}", cmd);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        set_lowest_priority(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| TranscodeError::Io(format!("failed to spawn encoder: {}", e)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::Io("failed to capture stderr".into()))?;

        let total_frames = profile.total_frames.unwrap_or(0);
        let mut reader = BufReader::new(stderr).lines();
        let mut parser = ProgressParser::new(total_frames);
        let mut last_lines: VecDeque<String> = VecDeque::with_capacity(12);
        let mut killed = false;

        loop {
            tokio::select! {
                line_res = reader.next_line() => {
                    match line_res {
                        Ok(Some(line)) => {
                            if last_lines.len() >= 12 {
                                last_lines.pop_front();
                            }
                            last_lines.push_back(line.clone());

                            if let Some(tick) = parser.feed(&line) {
                                let _ = progress_tx.try_send(tick);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Error reading encoder stderr: {}", e);
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    stop_child(&mut child).await;
                    killed = true;
                    break;
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| TranscodeError::Io(format!("failed to reap encoder: {}", e)))?;

        if killed {
            remove_partial(output).await;
            return Err(TranscodeError::Killed);
        }

        if !status.success() {
            remove_partial(output).await;
            let detail = last_lines.make_contiguous().join("\n");
            return Err(TranscodeError::EncoderCrash {
                message: detail,
                exit_code: status.code(),
            });
        }

        let output_size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if output_size == 0 {
            remove_partial(output).await;
            return Err(TranscodeError::EmptyOutput);
        }

        Ok(TranscodeOutput {
            output_path: output.to_path_buf(),
            output_size,
        })
    }
}

fn build_command(input: &Path, output: &Path, params: &EncodeParams) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y").arg("-i").arg(input);

    // Everything survives the container swap: one video stream, all audio,
    // all subtitles.
    cmd.args(["-map", "0:v:0", "-map", "0:a?", "-map", "0:s?"]);

    cmd.args(["-c:v", "libsvtav1"]);
    cmd.args(["-crf", &params.crf.to_string()]);
    cmd.args(["-preset", &params.preset.to_string()]);
    cmd.args(["-pix_fmt", &params.pixel_format]);

    if let Some(ref color) = params.color {
        cmd.args(["-color_primaries", &color.primaries]);
        cmd.args(["-color_trc", &color.transfer]);
        cmd.args(["-colorspace", &color.space]);
    }
    if params.attach_hdr_side_data {
        // svt-av1 copies mastering display / CLL side data from the input
        // when told to stay in the same color volume.
        cmd.args(["-svtav1-params", "enable-hdr=1"]);
    }

    if params.skip_audio_transcode {
        cmd.args(["-c:a", "copy"]);
    } else {
        cmd.args(["-c:a", "libopus"]);
        for (i, bitrate) in params.audio_bitrates.iter().enumerate() {
            cmd.arg(format!("-b:a:{}", i)).arg(bitrate.to_string());
        }
    }
    cmd.args(["-c:s", "copy"]);

    cmd.args(["-nostats", "-progress", "pipe:2"]);
    cmd.arg(output);
    cmd
}

#[cfg(unix)]
fn set_lowest_priority(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            libc::setpriority(libc::PRIO_PROCESS, 0, 19);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn set_lowest_priority(_cmd: &mut Command) {}

/// Polite stop first: ffmpeg treats `q` on stdin as a request to finish
/// the current write and exit. Hard kill after the grace period.
async fn stop_child(child: &mut Child) {
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Encoder ignored polite stop; killing");
            let _ = child.kill().await;
        }
    }
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => info!("Removed partial output {:?}", output),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {:?}: {}", output, e),
    }
}

/// Incremental parser for ffmpeg's `-progress` key=value stream. A tick is
/// emitted on each `progress=` flush line.
struct ProgressParser {
    total_frames: u64,
    frame: u64,
    fps: f64,
}

impl ProgressParser {
    fn new(total_frames: u64) -> Self {
        Self {
            total_frames,
            frame: 0,
            fps: 0.0,
        }
    }

    fn feed(&mut self, line: &str) -> Option<TranscodeProgress> {
        let (key, value) = line.split_once('=')?;
        match key.trim() {
            "frame" => {
                self.frame = value.trim().parse().unwrap_or(self.frame);
                None
            }
            "fps" => {
                self.fps = value.trim().parse().unwrap_or(self.fps);
                None
            }
            "progress" => Some(self.tick(value.trim() == "end")),
            _ => None,
        }
    }

    fn tick(&self, finished: bool) -> TranscodeProgress {
        let percent = if finished {
            100.0
        } else if self.total_frames > 0 {
            (self.frame as f64 / self.total_frames as f64 * 100.0).min(99.9)
        } else {
            0.0
        };

        let eta_seconds = if !finished && self.fps > 0.0 && self.total_frames > self.frame {
            Some(((self.total_frames - self.frame) as f64 / self.fps) as u64)
        } else {
            None
        };

        TranscodeProgress {
            percent,
            fps: self.fps,
            eta_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::policy::ColorParams;

    #[test]
    fn test_progress_parser_emits_on_flush() {
        let mut parser = ProgressParser::new(1000);
        assert!(parser.feed("frame=250").is_none());
        assert!(parser.feed("fps=50.0").is_none());
        let tick = parser.feed("progress=continue").expect("tick on flush");
        assert!((tick.percent - 25.0).abs() < 0.01);
        assert_eq!(tick.fps, 50.0);
        assert_eq!(tick.eta_seconds, Some(15));
    }

    #[test]
    fn test_progress_parser_end_is_full() {
        let mut parser = ProgressParser::new(1000);
        parser.feed("frame=1000");
        let tick = parser.feed("progress=end").expect("tick");
        assert_eq!(tick.percent, 100.0);
    }

    #[test]
    fn test_progress_parser_unknown_total() {
        let mut parser = ProgressParser::new(0);
        parser.feed("frame=99999");
        let tick = parser.feed("progress=continue").expect("tick");
        assert_eq!(tick.percent, 0.0);
        assert_eq!(tick.eta_seconds, None);
    }

    #[test]
    fn test_command_carries_hdr_color_params() {
        let params = EncodeParams {
            crf: 26,
            preset: 8,
            pixel_format: "yuv420p10le".into(),
            color: Some(ColorParams {
                primaries: "bt2020".into(),
                transfer: "smpte2084".into(),
                space: "bt2020nc".into(),
            }),
            attach_hdr_side_data: true,
            audio_bitrates: vec![256_000],
            skip_audio_transcode: false,
        };
        let cmd = build_command(Path::new("/in.mkv"), Path::new("/out.mkv"), &params);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["-color_trc", "smpte2084"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "libopus"]));
        assert!(args.windows(2).any(|w| w == ["-c:s", "copy"]));
    }

    #[test]
    fn test_command_audio_copy_mode() {
        let params = EncodeParams {
            crf: 28,
            preset: 8,
            pixel_format: "yuv420p".into(),
            color: None,
            attach_hdr_side_data: false,
            audio_bitrates: vec![],
            skip_audio_transcode: true,
        };
        let cmd = build_command(Path::new("/in.mkv"), Path::new("/out.mkv"), &params);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert!(!args.iter().any(|a| a == "libopus"));
    }
}

//! Transcoder implementation running `ffmpeg` as a child process

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    transcode::{AudioCodec, TranscodeOutput, TranscodeRequest, TranscodeTarget, Transcoder},
};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Only the tail of stderr is kept; ffmpeg prints the actual error last.
const STDERR_TAIL_BYTES: usize = 4096;

/// EBU R128 target used when loudness normalization is requested.
const LOUDNORM_FILTER: &str = "loudnorm=I=-23:LRA=7:TP=-2";

/// Runs `ffmpeg` for each request.
///
/// The child is killed when the future is dropped, so a caller-side
/// `tokio::time::timeout` also terminates the process.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    /// Use `ffmpeg` from `PATH`
    pub fn new() -> Self {
        Self::with_program("ffmpeg")
    }

    /// Use a specific executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Build the argument list for a request
    pub fn build_args(request: &TranscodeRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-hide_banner".into()];
        args.push("-i".into());
        args.push(request.input.clone().into());

        match &request.target {
            TranscodeTarget::Audio {
                codec,
                bitrate_kbps,
                normalize,
                artwork,
            } => {
                if let Some(artwork) = artwork {
                    args.push("-i".into());
                    args.push(artwork.clone().into());
                    for arg in [
                        "-map",
                        "0:a",
                        "-map",
                        "1:v",
                        "-c:v",
                        "mjpeg",
                        "-disposition:v",
                        "attached_pic",
                    ] {
                        args.push(arg.into());
                    }
                } else {
                    args.push("-vn".into());
                }

                let encoder = match codec {
                    AudioCodec::Aac => "aac",
                    AudioCodec::Mp3 => "libmp3lame",
                };
                args.push("-c:a".into());
                args.push(encoder.into());
                args.push("-b:a".into());
                args.push(format!("{bitrate_kbps}k").into());

                if *normalize {
                    args.push("-af".into());
                    args.push(LOUDNORM_FILTER.into());
                }
            }
            TranscodeTarget::Video {
                max_height,
                max_fps,
                reencode,
            } => {
                args.push("-an".into());
                if *reencode {
                    args.push("-vf".into());
                    args.push(format!("scale=-2:'min(ih,{max_height})',fps='min({max_fps},source_fps)'").into());
                    for arg in ["-c:v", "libx264", "-preset", "medium", "-crf", "23"] {
                        args.push(arg.into());
                    }
                } else {
                    args.push("-c:v".into());
                    args.push("copy".into());
                }
            }
        }

        args.push(request.output.clone().into());
        args
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let start = raw.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&raw[start..]).trim().to_string()
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeOutput> {
        let args = Self::build_args(request);
        debug!(
            program = %self.program.display(),
            input = %request.input.display(),
            output = %request.output.display(),
            "Running transcoder"
        );

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BridgeError::NotAvailable(format!(
                    "transcoder executable not found: {}",
                    self.program.display()
                )),
                _ => BridgeError::Io(e),
            })?;

        let result = TranscodeOutput {
            exit_code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        };

        if !result.success() {
            warn!(
                exit_code = ?result.exit_code,
                output = %request.output.display(),
                "Transcoder exited unsuccessfully"
            );
        }

        Ok(result)
    }
}

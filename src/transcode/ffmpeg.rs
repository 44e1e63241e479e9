use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{TranscodeTermination, Transcoder};
use crate::source::AudioStream;
use crate::utils::parse_timemark;

/// MP3 transcoder backed by an ffmpeg subprocess.
///
/// The raw audio stream is piped into ffmpeg's stdin; progress timemarks are
/// scraped from the `time=` fields ffmpeg prints on stderr.
pub struct FfmpegTranscoder {
    ffmpeg_path: String,
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }

    /// Check if ffmpeg is available
    pub async fn check_availability(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        mut input: AudioStream,
        bitrate: u32,
        output: &Path,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> TranscodeTermination {
        let mut child = match Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-y", "-i", "pipe:0", "-vn"])
            .args(["-codec:a", "libmp3lame", "-b:a", &format!("{bitrate}k")])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return TranscodeTermination::Failed(format!("failed to spawn ffmpeg: {e}")),
        };

        let Some(mut stdin) = child.stdin.take() else {
            return TranscodeTermination::Failed("ffmpeg did not expose a stdin pipe".to_string());
        };
        let Some(stderr) = child.stderr.take() else {
            return TranscodeTermination::Failed("ffmpeg did not expose a stderr pipe".to_string());
        };

        // Feed the source stream until EOF. A write error here means ffmpeg
        // went away; the exit status below carries the real cause.
        let pump = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut input, &mut stdin).await;
            let _ = stdin.shutdown().await;
        });

        // ffmpeg terminates progress lines with '\r' and diagnostics with '\n'.
        let mut segments = BufReader::new(stderr).split(b'\r');
        let mut last_log = String::new();

        let killed = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    break true;
                }
                segment = segments.next_segment() => match segment {
                    Ok(Some(bytes)) => {
                        let text = String::from_utf8_lossy(&bytes);
                        if let Some(seconds) = extract_progress_seconds(&text) {
                            let _ = progress.send(seconds);
                        }
                        if let Some(line) = text.lines().rev().find(|l| !l.trim().is_empty()) {
                            last_log = line.trim().to_string();
                        }
                    }
                    Ok(None) | Err(_) => break false,
                }
            }
        };

        let status = child.wait().await;
        pump.abort();

        if killed || cancel.is_cancelled() {
            return TranscodeTermination::Killed;
        }

        match status {
            Ok(status) if status.success() => TranscodeTermination::Completed,
            Ok(status) => TranscodeTermination::Failed(if last_log.is_empty() {
                format!("ffmpeg exited with {status}")
            } else {
                format!("ffmpeg exited with {status}: {last_log}")
            }),
            Err(e) => TranscodeTermination::Failed(format!("failed to reap ffmpeg: {e}")),
        }
    }
}

/// Pull the elapsed seconds out of an ffmpeg stderr progress chunk,
/// e.g. `size=... time=00:01:23.45 bitrate=...`.
fn extract_progress_seconds(chunk: &str) -> Option<u64> {
    let index = chunk.rfind("time=")?;
    let mark = chunk[index + 5..].split_whitespace().next()?;
    parse_timemark(mark)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_progress_seconds() {
        let chunk = "size=     512kB time=00:00:30.12 bitrate= 139.7kbits/s speed=11.2x";
        assert_eq!(extract_progress_seconds(chunk), Some(30));
    }

    #[test]
    fn test_extract_progress_seconds_takes_latest_mark() {
        let chunk = "time=00:00:10.00 ...\ntime=00:00:20.00 bitrate=...";
        assert_eq!(extract_progress_seconds(chunk), Some(20));
    }

    #[test]
    fn test_extract_progress_seconds_ignores_diagnostics() {
        assert_eq!(extract_progress_seconds("Press [q] to stop"), None);
        assert_eq!(extract_progress_seconds("time=N/A bitrate=N/A"), None);
    }
}

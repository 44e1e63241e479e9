use async_trait::async_trait;
use serde_json::Value;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

use super::{AudioStream, SourceError, VideoId, VideoInfo, VideoSource};

/// YouTube video source backed by yt-dlp
pub struct YtDlpSource {
    yt_dlp_path: String,
}

impl YtDlpSource {
    pub fn new() -> Self {
        Self {
            yt_dlp_path: "yt-dlp".to_string(),
        }
    }

    /// Check if yt-dlp is available
    pub async fn check_availability(&self) -> bool {
        Command::new(&self.yt_dlp_path)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn watch_url(id: &VideoId) -> String {
        format!("https://www.youtube.com/watch?v={id}")
    }
}

#[async_trait]
impl VideoSource for YtDlpSource {
    async fn fetch_info(&self, id: &VideoId) -> Result<VideoInfo, SourceError> {
        tracing::debug!("Fetching video info for: {}", id);

        let output = Command::new(&self.yt_dlp_path)
            .args([
                "--dump-json",
                "--no-playlist",
                "--skip-download",
                &Self::watch_url(id),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!("yt-dlp lookup failed for {}: {}", id, stderr.trim());
            return Err(SourceError::NotFound(id.clone()));
        }

        let info: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| SourceError::Unavailable(format!("unreadable yt-dlp metadata: {e}")))?;

        let canonical_id = info["id"].as_str().map(VideoId::new).unwrap_or_else(|| id.clone());
        let title = info["title"].as_str().unwrap_or("audio").to_string();
        let length_seconds = info["duration"].as_f64().map(|d| d as u64).unwrap_or(0);

        Ok(VideoInfo {
            id: canonical_id,
            title,
            length_seconds,
        })
    }

    async fn open_audio_stream(&self, id: &VideoId) -> Result<AudioStream, SourceError> {
        tracing::debug!("Opening audio stream for: {}", id);

        let mut child = Command::new(&self.yt_dlp_path)
            .args([
                "--format",
                "bestaudio",
                "--no-playlist",
                "--quiet",
                "--output",
                "-",
                &Self::watch_url(id),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SourceError::Unavailable("yt-dlp did not expose a stdout pipe".to_string())
        })?;

        Ok(Box::new(YtDlpStream {
            _child: child,
            stdout,
        }))
    }
}

impl Default for YtDlpSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the yt-dlp process alive for as long as its output is being read.
/// Dropping the stream kills the process.
struct YtDlpStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for YtDlpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

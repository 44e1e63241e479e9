use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncRead;

pub mod youtube;

/// Opaque identifier of a source video, externally supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoId(String);

impl VideoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for a resolved video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Canonical video id reported by the platform
    pub id: VideoId,

    /// Video title, used as the delivered audio filename
    pub title: String,

    /// Source duration in seconds; 0 when the platform does not report one
    pub length_seconds: u64,
}

/// Raw audio-only byte stream handed to the transcoder
pub type AudioStream = Box<dyn AsyncRead + Send + Unpin>;

/// Errors surfaced by a video source
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// The platform could not resolve the id
    #[error("video not found: {0}")]
    NotFound(VideoId),

    /// The platform resolved the id but the source could not be used
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for looking up video metadata and acquiring raw audio streams
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Resolve a video id to its metadata
    async fn fetch_info(&self, id: &VideoId) -> Result<VideoInfo, SourceError>;

    /// Open a byte stream of the highest available audio-only quality
    async fn open_audio_stream(&self, id: &VideoId) -> Result<AudioStream, SourceError>;
}

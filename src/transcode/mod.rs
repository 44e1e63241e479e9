use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::source::AudioStream;

pub mod ffmpeg;

/// How a transcoding process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeTermination {
    /// Process ran to completion and wrote the output file
    Completed,

    /// Process was terminated through the task's cancellation handle
    Killed,

    /// Any other process failure, with the cause text
    Failed(String),
}

/// Trait for the external transcoding process.
///
/// Implementations consume a raw audio byte stream, write an audio file
/// encoded at `bitrate` kbit/s to `output`, and report elapsed whole seconds
/// on `progress` as the encode advances. Cancelling `cancel` must terminate
/// the process and surface as [`TranscodeTermination::Killed`].
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        input: AudioStream,
        bitrate: u32,
        output: &Path,
        progress: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> TranscodeTermination;
}

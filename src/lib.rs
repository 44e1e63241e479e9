//! Audiofetch - converts remote videos into size-bounded audio files
//!
//! This library fetches a video from a remote platform (YouTube), transcodes its
//! audio track into an MP3 bounded by the delivery channel's attachment size cap,
//! and reports progress until completion, cancellation, or failure.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod policy;
pub mod registry;
pub mod source;
pub mod task;
pub mod transcode;
pub mod utils;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use dispatch::{DeliveryChannel, Dispatcher};
pub use registry::{AdmissionError, RequesterId, TaskRegistry};
pub use source::{VideoId, VideoInfo, VideoSource};
pub use task::{ConversionTask, TaskHandle, TaskOutcome, TaskStatus};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Reasons a conversion task cannot be created
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("video not found")]
    NotFound,

    #[error("video too long: at {bitrate} kbps the maximum length is {max_length_seconds:.0}s")]
    TooLong {
        bitrate: u32,
        max_length_seconds: f64,
    },

    #[error("audio source failed: {0}")]
    Source(String),
}

//! Request dispatching.
//!
//! The dispatcher receives inbound commands (`convert`, `cancel`, `allow`,
//! `help`), consults the admission registry, and drives a conversion task
//! through completion while relaying progress to the requester over a
//! [`DeliveryChannel`].

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::policy;
use crate::registry::{RequesterId, TaskRegistry};
use crate::source::VideoSource;
use crate::task::{ConversionTask, TaskHandle, TaskOutcome};
use crate::transcode::Transcoder;
use crate::utils::{extract_video_id, sanitize_filename};
use crate::Result;

pub mod console;

pub use console::ConsoleChannel;

/// Trait for the chat-transport boundary.
///
/// A requester sees a single evolving status message per request plus, on
/// success, the finished audio file as an attachment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Post a new status message, returning an id usable for later edits
    async fn send_status(&self, requester: RequesterId, text: &str) -> Result<u64>;

    /// Replace the text of a previously sent status message
    async fn update_status(&self, requester: RequesterId, message_id: u64, text: &str)
        -> Result<()>;

    /// Remove a previously sent status message
    async fn delete_status(&self, requester: RequesterId, message_id: u64) -> Result<()>;

    /// Deliver the finished audio file
    async fn send_audio(
        &self,
        requester: RequesterId,
        audio: &Path,
        caption: &str,
        filename: &str,
    ) -> Result<()>;
}

/// One evolving status message; edits are suppressed when the text is unchanged.
struct StatusMessage<'a, C: DeliveryChannel> {
    channel: &'a C,
    requester: RequesterId,
    message_id: u64,
    last_text: String,
}

impl<'a, C: DeliveryChannel> StatusMessage<'a, C> {
    async fn send(channel: &'a C, requester: RequesterId, text: &str) -> Result<Self> {
        let message_id = channel.send_status(requester, text).await?;
        Ok(Self {
            channel,
            requester,
            message_id,
            last_text: text.to_string(),
        })
    }

    async fn update(&mut self, text: &str) -> Result<()> {
        if self.last_text == text {
            return Ok(());
        }
        self.last_text = text.to_string();
        self.channel
            .update_status(self.requester, self.message_id, text)
            .await
    }

    async fn delete(self) -> Result<()> {
        self.channel
            .delete_status(self.requester, self.message_id)
            .await
    }
}

pub struct Dispatcher<C: DeliveryChannel> {
    config: tokio::sync::Mutex<Config>,
    registry: TaskRegistry,
    source: Arc<dyn VideoSource>,
    transcoder: Arc<dyn Transcoder>,
    channel: C,
}

impl<C: DeliveryChannel> Dispatcher<C> {
    pub fn new(
        config: Config,
        channel: C,
        source: Arc<dyn VideoSource>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let registry = TaskRegistry::new(config.conversion.max_queue_size);
        Self {
            config: tokio::sync::Mutex::new(config),
            registry,
            source,
            transcoder,
            channel,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Handle a `convert(url)` command from `requester`.
    pub async fn handle_convert(&self, requester: RequesterId, url: &str) -> Result<()> {
        let Some(video_id) = extract_video_id(url) else {
            self.channel
                .send_status(requester, "That does not look like a YouTube video link.")
                .await?;
            return Ok(());
        };

        let (permitted, bitrate, download_dir) = {
            let config = self.config.lock().await;
            (
                config.access.permits(requester),
                config.conversion.bitrate,
                config.download_dir(),
            )
        };

        if !permitted {
            self.channel
                .send_status(requester, "You are not on this bot's whitelist.")
                .await?;
            return Ok(());
        }

        // Reserve the slot before the metadata fetch so a second request from
        // the same requester cannot slip past the check.
        let ticket = match self.registry.try_admit(requester) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.channel.send_status(requester, &e.to_string()).await?;
                return Ok(());
            }
        };

        let mut status =
            StatusMessage::send(&self.channel, requester, "Received your conversion request!")
                .await?;
        status.update("Resolving video information...").await?;

        let task = match ConversionTask::create(
            Arc::clone(&self.source),
            Arc::clone(&self.transcoder),
            &video_id,
            bitrate,
            &download_dir,
        )
        .await
        {
            Ok(task) => task,
            Err(e) => {
                // The ticket drops here, releasing the reserved slot.
                status.update(&format!("Conversion failed: {e}")).await?;
                return Ok(());
            }
        };

        ticket.bind(Arc::clone(&task));

        let Some(TaskHandle {
            mut progress,
            mut outcome,
        }) = task.start()
        else {
            status
                .update("Conversion failed: task could not be started.")
                .await?;
            return Ok(());
        };

        status.update(&converting_text(0)).await?;

        let pending = loop {
            tokio::select! {
                biased;
                maybe_percent = progress.recv() => match maybe_percent {
                    Some(percent) => status.update(&converting_text(percent)).await?,
                    None => break None,
                },
                result = &mut outcome => break Some(result),
            }
        };
        let outcome = match pending {
            Some(result) => result,
            None => outcome.await,
        }
        .unwrap_or_else(|_| TaskOutcome::Failed("conversion task was dropped".to_string()));

        match outcome {
            TaskOutcome::Finished => {
                status.update("Conversion finished! Sending audio...").await?;
                self.channel
                    .send_audio(
                        requester,
                        task.audio_path(),
                        "Here is your MP3!",
                        &format!("{}.mp3", sanitize_filename(&task.info().title)),
                    )
                    .await?;
                status.delete().await?;
                if let Err(e) = tokio::fs::remove_dir_all(task.folder()).await {
                    warn!(video = %task.info().id, "could not remove delivered output: {e}");
                }
            }
            TaskOutcome::Canceled => {
                status.update("Conversion canceled.").await?;
            }
            TaskOutcome::Failed(cause) => {
                status
                    .update(&format!(
                        "Conversion failed: {cause}\n\nVideo id: {}",
                        task.info().id
                    ))
                    .await?;
            }
        }

        Ok(())
    }

    /// Handle a `cancel` command: route it to the requester's active task.
    pub fn handle_cancel(&self, requester: RequesterId) {
        match self.registry.lookup(requester) {
            Some(task) => task.cancel(),
            None => debug!(requester, "cancel requested with no active task"),
        }
    }

    /// Handle an `allow(identity)` command. Owner only; silently ignored
    /// otherwise.
    pub async fn handle_allow(&self, requester: RequesterId, user: RequesterId) -> Result<()> {
        let mut config = self.config.lock().await;
        if !config.access.is_owner(requester) {
            debug!(requester, "allow requested by non-owner");
            return Ok(());
        }

        if config.access.allow(user) {
            if let Err(e) = config.save().await {
                warn!("could not persist whitelist: {e:#}");
            }
        }
        drop(config);

        self.channel
            .send_status(requester, &format!("Added {user} to the whitelist."))
            .await?;
        Ok(())
    }

    /// Handle a `help` command.
    pub async fn handle_help(&self, requester: RequesterId) -> Result<()> {
        let bitrate = self.config.lock().await.conversion.bitrate;
        let text = format!(
            "I convert YouTube videos into MP3 audio.\n\
             Paste a video link to start a conversion, or /cancel to abort one.\n\
             Current bitrate: {bitrate} kbps\n\
             Maximum video length: {:.0}s",
            policy::max_length_seconds(bitrate)
        );
        self.channel.send_status(requester, &text).await?;
        Ok(())
    }
}

fn converting_text(percent: u8) -> String {
    format!("Converting to MP3 - {percent}%\n\nSend /cancel to abort.")
}

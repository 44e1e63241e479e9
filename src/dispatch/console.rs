use async_trait::async_trait;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::DeliveryChannel;
use crate::registry::RequesterId;
use crate::Result;

/// Console rendering of the delivery-channel contract, used by the CLI
/// modes. Each status message becomes a spinner line; a delivered audio
/// file is copied into the current directory.
pub struct ConsoleChannel {
    bars: Mutex<HashMap<u64, ProgressBar>>,
    next_id: AtomicU64,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Stop all live spinners, keeping their final text visible.
    pub fn finish_all(&self) {
        for (_, bar) in self.lock_bars().drain() {
            bar.finish();
        }
    }

    fn lock_bars(&self) -> MutexGuard<'_, HashMap<u64, ProgressBar>> {
        self.bars.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryChannel for ConsoleChannel {
    async fn send_status(&self, _requester: RequesterId, text: &str) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(single_line(text));

        self.lock_bars().insert(id, bar);
        Ok(id)
    }

    async fn update_status(
        &self,
        _requester: RequesterId,
        message_id: u64,
        text: &str,
    ) -> Result<()> {
        if let Some(bar) = self.lock_bars().get(&message_id) {
            bar.set_message(single_line(text));
        }
        Ok(())
    }

    async fn delete_status(&self, _requester: RequesterId, message_id: u64) -> Result<()> {
        if let Some(bar) = self.lock_bars().remove(&message_id) {
            bar.finish_and_clear();
        }
        Ok(())
    }

    async fn send_audio(
        &self,
        _requester: RequesterId,
        audio: &Path,
        caption: &str,
        filename: &str,
    ) -> Result<()> {
        let destination = std::env::current_dir()?.join(filename);
        fs_err::copy(audio, &destination)?;

        println!(
            "{} {}",
            style("Saved:").green().bold(),
            destination.display()
        );
        println!("{caption}");
        Ok(())
    }
}

fn single_line(text: &str) -> String {
    text.replace('\n', "  ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_single_line() {
        assert_eq!(single_line("a\nb\n\nc"), "a  b    c");
    }

    #[tokio::test]
    async fn test_status_message_lifecycle() {
        let channel = ConsoleChannel::new();

        let id = channel.send_status(0, "working").await.unwrap();
        assert_eq!(channel.lock_bars().len(), 1);

        channel.update_status(0, id, "still working").await.unwrap();
        channel.delete_status(0, id).await.unwrap();
        assert!(channel.lock_bars().is_empty());

        // Updating a deleted message is a quiet no-op.
        channel.update_status(0, id, "gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_audio_copies_into_cwd() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("audio.mp3");
        std::fs::write(&audio, b"mp3").unwrap();

        let channel = ConsoleChannel::new();
        channel
            .send_audio(0, &audio, "done", "delivered-test.mp3")
            .await
            .unwrap();

        let delivered = std::env::current_dir().unwrap().join("delivered-test.mp3");
        assert!(delivered.exists());
        std::fs::remove_file(delivered).unwrap();
    }
}

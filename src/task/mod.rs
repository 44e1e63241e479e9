//! The conversion task state machine.
//!
//! A [`ConversionTask`] owns one video's metadata, its target bitrate, the
//! filesystem area derived from `(video id, bitrate)`, and the cancellation
//! token threaded into the external transcoding process. Lifecycle:
//! `Unstarted -> Running -> {Finished | Canceled | Failed}`; `Unstarted` and
//! the terminal states accept no further transitions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::policy;
use crate::source::{SourceError, VideoId, VideoInfo, VideoSource};
use crate::transcode::{TranscodeTermination, Transcoder};
use crate::utils::exists;
use crate::ConvertError;

/// File name of the produced audio inside the task's output directory
pub const AUDIO_FILE_NAME: &str = "audio.mp3";

/// Lifecycle states of a conversion task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Unstarted,
    Running,
    Finished,
    Canceled,
    Failed,
}

/// Terminal outcome of a task that reached `Running`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    Canceled,
    Failed(String),
}

/// Observer side of a started task.
///
/// Progress percentages arrive on `progress`; the single terminal outcome is
/// delivered on `outcome` after the last progress event. The successful
/// return of [`ConversionTask::start`] is the start signal itself.
pub struct TaskHandle {
    pub progress: mpsc::UnboundedReceiver<u8>,
    pub outcome: oneshot::Receiver<TaskOutcome>,
}

pub struct ConversionTask {
    info: VideoInfo,
    bitrate: u32,
    folder: PathBuf,
    audio_path: PathBuf,
    status: Mutex<TaskStatus>,
    cancel_token: CancellationToken,
    source: Arc<dyn VideoSource>,
    transcoder: Arc<dyn Transcoder>,
}

impl std::fmt::Debug for ConversionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionTask")
            .field("info", &self.info)
            .field("bitrate", &self.bitrate)
            .field("folder", &self.folder)
            .field("audio_path", &self.audio_path)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl ConversionTask {
    /// Resolve a video and prepare a task in `Unstarted`.
    ///
    /// Fetches metadata from the video source, validates the duration against
    /// the size-derived length bound for `bitrate`, and computes the output
    /// path `<base_path>/<video id>/<bitrate>/audio.mp3`. No process is
    /// spawned here.
    pub async fn create(
        source: Arc<dyn VideoSource>,
        transcoder: Arc<dyn Transcoder>,
        video_id: &VideoId,
        bitrate: u32,
        base_path: &Path,
    ) -> Result<Arc<Self>, ConvertError> {
        let info = source.fetch_info(video_id).await.map_err(|e| match e {
            SourceError::NotFound(_) => ConvertError::NotFound,
            other => ConvertError::Source(other.to_string()),
        })?;

        policy::validate(info.length_seconds, bitrate)?;

        let folder = base_path.join(info.id.as_str()).join(bitrate.to_string());
        let audio_path = folder.join(AUDIO_FILE_NAME);

        Ok(Arc::new(Self {
            info,
            bitrate,
            folder,
            audio_path,
            status: Mutex::new(TaskStatus::Unstarted),
            cancel_token: CancellationToken::new(),
            source,
            transcoder,
        }))
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn status(&self) -> TaskStatus {
        *self.lock_status()
    }

    /// Path of the produced audio file
    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    /// Per-video-and-bitrate directory owned by this task
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Transition to `Running` and drive the conversion in the background.
    ///
    /// Returns the handle observing this task, or `None` (with a logged
    /// warning) if the task was started before.
    pub fn start(self: &Arc<Self>) -> Option<TaskHandle> {
        {
            let mut status = self.lock_status();
            if *status != TaskStatus::Unstarted {
                let current = *status;
                warn!(video = %self.info.id, status = ?current, "task already started");
                return None;
            }
            *status = TaskStatus::Running;
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let task = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = task.execute(progress_tx).await;
            *task.lock_status() = match &outcome {
                TaskOutcome::Finished => TaskStatus::Finished,
                TaskOutcome::Canceled => TaskStatus::Canceled,
                TaskOutcome::Failed(_) => TaskStatus::Failed,
            };
            let _ = outcome_tx.send(outcome);
        });

        Some(TaskHandle {
            progress: progress_rx,
            outcome: outcome_rx,
        })
    }

    /// Request cooperative cancellation of a running task.
    ///
    /// A no-op outside `Running`. The token exists from creation time, so a
    /// cancel landing in the window between the `Running` transition and the
    /// process spawn is still honored. The task transitions to `Canceled`
    /// only once the transcoding process has actually terminated.
    pub fn cancel(&self) {
        if *self.lock_status() != TaskStatus::Running {
            return;
        }
        self.cancel_token.cancel();
    }

    async fn execute(&self, progress: mpsc::UnboundedSender<u8>) -> TaskOutcome {
        // A cancel that arrived before the process exists.
        if self.cancel_token.is_cancelled() {
            return TaskOutcome::Canceled;
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.folder).await {
            return TaskOutcome::Failed(format!(
                "could not create {}: {e}",
                self.folder.display()
            ));
        }

        if exists(&self.audio_path).await {
            info!(video = %self.info.id, "output already present, skipping transcode");
            return TaskOutcome::Finished;
        }

        let stream = match self.source.open_audio_stream(&self.info.id).await {
            Ok(stream) => stream,
            Err(e) => {
                self.remove_output_dir().await;
                return TaskOutcome::Failed(e.to_string());
            }
        };

        // The transcoder reports raw elapsed seconds; combine with the known
        // source length into percentages for the observer.
        let (elapsed_tx, mut elapsed_rx) = mpsc::unbounded_channel();
        let length_seconds = self.info.length_seconds;
        let forward = tokio::spawn(async move {
            while let Some(elapsed) = elapsed_rx.recv().await {
                if progress.send(progress_percent(elapsed, length_seconds)).is_err() {
                    break;
                }
            }
        });

        let termination = self
            .transcoder
            .transcode(
                stream,
                self.bitrate,
                &self.audio_path,
                elapsed_tx,
                self.cancel_token.clone(),
            )
            .await;

        // The sender went away with the transcoder; drain before the terminal
        // outcome so progress never trails it.
        let _ = forward.await;

        match termination {
            TranscodeTermination::Completed => TaskOutcome::Finished,
            TranscodeTermination::Killed => {
                self.remove_output_dir().await;
                TaskOutcome::Canceled
            }
            TranscodeTermination::Failed(cause) => {
                self.remove_output_dir().await;
                TaskOutcome::Failed(cause)
            }
        }
    }

    async fn remove_output_dir(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.folder).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(video = %self.info.id, "could not remove {}: {e}", self.folder.display());
            }
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, TaskStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Percentage of the source already transcoded.
///
/// A zero (unknown) source length reports 100 rather than dividing by zero:
/// an empty source has nothing left to encode.
pub(crate) fn progress_percent(elapsed_seconds: u64, length_seconds: u64) -> u8 {
    if length_seconds == 0 {
        return 100;
    }
    ((elapsed_seconds * 100) / length_seconds).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AudioStream, MockVideoSource};
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn video_info(length_seconds: u64) -> VideoInfo {
        VideoInfo {
            id: VideoId::new("dQw4w9WgXcQ"),
            title: "Test Video".to_string(),
            length_seconds,
        }
    }

    fn source_returning(info: VideoInfo) -> Arc<MockVideoSource> {
        let mut source = MockVideoSource::new();
        source
            .expect_fetch_info()
            .returning(move |_| Ok(info.clone()));
        source
            .expect_open_audio_stream()
            .returning(|_| Ok(Box::new(tokio::io::empty()) as AudioStream));
        Arc::new(source)
    }

    /// Sends the given elapsed marks, then terminates as configured.
    struct ScriptedTranscoder {
        marks: Vec<u64>,
        termination: TranscodeTermination,
    }

    #[async_trait]
    impl Transcoder for ScriptedTranscoder {
        async fn transcode(
            &self,
            _input: AudioStream,
            _bitrate: u32,
            output: &Path,
            progress: mpsc::UnboundedSender<u64>,
            _cancel: CancellationToken,
        ) -> TranscodeTermination {
            for mark in &self.marks {
                let _ = progress.send(*mark);
            }
            if self.termination == TranscodeTermination::Completed {
                tokio::fs::write(output, b"mp3").await.unwrap();
            }
            self.termination.clone()
        }
    }

    /// Blocks until the cancellation token fires, then reports a kill.
    struct WaitForCancelTranscoder;

    #[async_trait]
    impl Transcoder for WaitForCancelTranscoder {
        async fn transcode(
            &self,
            _input: AudioStream,
            _bitrate: u32,
            _output: &Path,
            progress: mpsc::UnboundedSender<u64>,
            cancel: CancellationToken,
        ) -> TranscodeTermination {
            let _ = progress.send(5);
            cancel.cancelled().await;
            TranscodeTermination::Killed
        }
    }

    async fn make_task(
        length_seconds: u64,
        bitrate: u32,
        base: &Path,
        termination: TranscodeTermination,
        marks: Vec<u64>,
    ) -> Arc<ConversionTask> {
        ConversionTask::create(
            source_returning(video_info(length_seconds)),
            Arc::new(ScriptedTranscoder { marks, termination }),
            &VideoId::new("dQw4w9WgXcQ"),
            bitrate,
            base,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(30, 120), 25);
        assert_eq!(progress_percent(0, 120), 0);
        assert_eq!(progress_percent(120, 120), 100);
        assert_eq!(progress_percent(121, 120), 100);
        // floor semantics
        assert_eq!(progress_percent(1, 3), 33);
    }

    #[test]
    fn test_progress_percent_zero_length_clamps() {
        assert_eq!(progress_percent(0, 0), 100);
        assert_eq!(progress_percent(30, 0), 100);
    }

    #[tokio::test]
    async fn test_create_passes_duration_policy() {
        let base = TempDir::new().unwrap();
        let task = make_task(300, 128, base.path(), TranscodeTermination::Completed, vec![]).await;

        assert_eq!(task.status(), TaskStatus::Unstarted);
        assert_eq!(task.bitrate(), 128);
        assert!(task
            .audio_path()
            .ends_with("dQw4w9WgXcQ/128/audio.mp3"));
    }

    #[tokio::test]
    async fn test_create_rejects_too_long_video() {
        let base = TempDir::new().unwrap();
        let err = ConversionTask::create(
            source_returning(video_info(2000)),
            Arc::new(ScriptedTranscoder {
                marks: vec![],
                termination: TranscodeTermination::Completed,
            }),
            &VideoId::new("dQw4w9WgXcQ"),
            128,
            base.path(),
        )
        .await
        .unwrap_err();

        match err {
            ConvertError::TooLong {
                bitrate,
                max_length_seconds,
            } => {
                assert_eq!(bitrate, 128);
                assert_eq!(max_length_seconds, 1250.0);
            }
            other => panic!("expected TooLong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_maps_lookup_failure_to_not_found() {
        let mut source = MockVideoSource::new();
        source
            .expect_fetch_info()
            .returning(|id| Err(SourceError::NotFound(id.clone())));

        let base = TempDir::new().unwrap();
        let err = ConversionTask::create(
            Arc::new(source),
            Arc::new(ScriptedTranscoder {
                marks: vec![],
                termination: TranscodeTermination::Completed,
            }),
            &VideoId::new("missing_vid"),
            128,
            base.path(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ConvertError::NotFound));
    }

    #[tokio::test]
    async fn test_start_reports_progress_then_finishes() {
        let base = TempDir::new().unwrap();
        let task = make_task(
            120,
            128,
            base.path(),
            TranscodeTermination::Completed,
            vec![30, 60, 120],
        )
        .await;

        let mut handle = task.start().unwrap();
        let outcome = handle.outcome.await.unwrap();
        assert_eq!(outcome, TaskOutcome::Finished);
        assert_eq!(task.status(), TaskStatus::Finished);

        let mut seen = Vec::new();
        while let Ok(percent) = handle.progress.try_recv() {
            seen.push(percent);
        }
        assert_eq!(seen, vec![25, 50, 100]);
        assert!(task.audio_path().exists());
    }

    #[tokio::test]
    async fn test_start_twice_is_a_noop() {
        let base = TempDir::new().unwrap();
        let task = make_task(120, 128, base.path(), TranscodeTermination::Completed, vec![]).await;

        let handle = task.start().unwrap();
        assert!(task.start().is_none());
        handle.outcome.await.unwrap();
        assert!(task.start().is_none());
    }

    #[tokio::test]
    async fn test_existing_output_skips_transcode() {
        let base = TempDir::new().unwrap();

        // Transcoder would fail if invoked; a cached file must short-circuit it.
        let task = make_task(
            120,
            128,
            base.path(),
            TranscodeTermination::Failed("must not run".to_string()),
            vec![],
        )
        .await;
        std::fs::create_dir_all(task.folder()).unwrap();
        std::fs::write(task.audio_path(), b"cached").unwrap();

        let handle = task.start().unwrap();
        assert_eq!(handle.outcome.await.unwrap(), TaskOutcome::Finished);
        assert_eq!(task.status(), TaskStatus::Finished);
        assert!(task.audio_path().exists());
    }

    #[tokio::test]
    async fn test_kill_termination_becomes_canceled_and_cleans_up() {
        let base = TempDir::new().unwrap();
        let task = make_task(120, 128, base.path(), TranscodeTermination::Killed, vec![]).await;

        let handle = task.start().unwrap();
        assert_eq!(handle.outcome.await.unwrap(), TaskOutcome::Canceled);
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(!task.folder().exists());
    }

    #[tokio::test]
    async fn test_failure_cleans_up_and_reports_cause() {
        let base = TempDir::new().unwrap();
        let task = make_task(
            120,
            128,
            base.path(),
            TranscodeTermination::Failed("encoder blew up".to_string()),
            vec![],
        )
        .await;

        let handle = task.start().unwrap();
        match handle.outcome.await.unwrap() {
            TaskOutcome::Failed(cause) => assert_eq!(cause, "encoder blew up"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(!task.folder().exists());
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let base = TempDir::new().unwrap();
        let task = ConversionTask::create(
            source_returning(video_info(120)),
            Arc::new(WaitForCancelTranscoder),
            &VideoId::new("dQw4w9WgXcQ"),
            128,
            base.path(),
        )
        .await
        .unwrap();

        let mut handle = task.start().unwrap();

        // First progress event proves the process is up before we cancel.
        let percent = handle.progress.recv().await.unwrap();
        assert_eq!(percent, 4);

        task.cancel();
        assert_eq!(handle.outcome.await.unwrap(), TaskOutcome::Canceled);
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(!task.folder().exists());
    }

    #[tokio::test]
    async fn test_cancel_outside_running_is_a_noop() {
        let base = TempDir::new().unwrap();
        let task = make_task(120, 128, base.path(), TranscodeTermination::Completed, vec![]).await;

        // Unstarted: nothing happens, the task can still run to completion.
        task.cancel();
        assert_eq!(task.status(), TaskStatus::Unstarted);

        let handle = task.start().unwrap();
        assert_eq!(handle.outcome.await.unwrap(), TaskOutcome::Finished);

        // Terminal: still nothing, no new events, no panic.
        task.cancel();
        assert_eq!(task.status(), TaskStatus::Finished);
    }

    #[tokio::test]
    async fn test_terminal_outcome_is_delivered_after_all_progress() {
        let base = TempDir::new().unwrap();
        let task = make_task(
            100,
            128,
            base.path(),
            TranscodeTermination::Completed,
            vec![10, 20, 30],
        )
        .await;

        let mut handle = task.start().unwrap();
        handle.outcome.await.unwrap();

        // Every progress event is already buffered once the outcome resolves.
        let mut count = 0;
        while handle.progress.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}

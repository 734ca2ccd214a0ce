//! The job queue: any number of producers, exactly one consumer.
//!
//! All generation work runs through [`JobWorker::run`], one job at a time in
//! enqueue order. A job's failure, panic or timeout is reported on its own
//! progress message and never stops the loop.

use crate::error::JobError;
use crate::progress::{ProgressReporter, ProgressState};
use async_trait::async_trait;
use bb_channels::{ChannelAdapter, MessageId};
use bb_gen::{BLEND_SOURCES_MAX, BLEND_SOURCES_MIN};
use bb_media::{ImageSource, OutputFormat, TempResources};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

pub const MAX_COUNT: u8 = 4;
pub const EDIT_SOURCES_MAX: usize = 4;
pub const SHUTDOWN_MESSAGE: &str =
    "❌ The bot is shutting down and this job was cancelled. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Generate,
    Edit,
    Blend,
}

impl JobKind {
    /// Admission key and chat command name.
    pub fn command_name(self) -> &'static str {
        match self {
            Self::Generate => "imagine",
            Self::Edit => "edit",
            Self::Blend => "blend",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Generate => "🎨 Image Generation Progress",
            Self::Edit => "✏️ Image Edit Progress",
            Self::Blend => "🌀 Image Blend Progress",
        }
    }

    /// Past tense used in the completion line.
    pub fn verb(self) -> &'static str {
        match self {
            Self::Generate => "Generated",
            Self::Edit => "Edited",
            Self::Blend => "Blended",
        }
    }

    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Generate => "generated",
            Self::Edit => "edited",
            Self::Blend => "blended",
        }
    }

    pub fn working_state(self) -> ProgressState {
        match self {
            Self::Generate => ProgressState::Generating,
            Self::Edit => ProgressState::Editing,
            Self::Blend => ProgressState::Blending,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// Everything a job needs from the user. Serializable so follow-ups can
/// replay it without asking again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default = "default_count")]
    pub count: u8,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub strength: Option<f32>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub sources: Vec<ImageSource>,
    #[serde(default)]
    pub mask: Option<ImageSource>,
}

fn default_count() -> u8 {
    1
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            style: None,
            count: default_count(),
            seed: None,
            strength: None,
            format: OutputFormat::default(),
            size: None,
            sources: Vec::new(),
            mask: None,
        }
    }
}

impl JobParams {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Where a job reports back to.
#[derive(Clone)]
pub struct JobContext {
    pub channel: Arc<dyn ChannelAdapter>,
    pub recipient: String,
    pub user_id: String,
    pub reply_to: Option<MessageId>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("channel", &self.channel.channel_id())
            .field("recipient", &self.recipient)
            .field("user_id", &self.user_id)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Ulid,
    pub kind: JobKind,
    pub context: JobContext,
    pub params: JobParams,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(kind: JobKind, context: JobContext, params: JobParams) -> Self {
        Self {
            id: Ulid::new(),
            kind,
            context,
            params,
            enqueued_at: Utc::now(),
        }
    }
}

/// Runs one dequeued job. Implementations own the whole pipeline between
/// the first progress transition and `complete`.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(
        &self,
        item: &QueueItem,
        temp: &mut TempResources,
        progress: &mut ProgressReporter,
    ) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Each job gets `temp_root/<job id>` for its scratch files.
    pub temp_root: PathBuf,
    pub job_timeout: Option<Duration>,
    pub progress_step_delay: Duration,
}

/// Creates the producer handle and the single consumer.
pub fn job_queue(processor: Arc<dyn JobProcessor>, options: WorkerOptions) -> (JobSender, JobWorker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    let sender = JobSender {
        tx,
        pending: pending.clone(),
    };
    let worker = JobWorker {
        rx,
        processor,
        pending,
        options,
    };
    (sender, worker)
}

#[derive(Clone)]
pub struct JobSender {
    tx: mpsc::UnboundedSender<QueueItem>,
    pending: Arc<AtomicUsize>,
}

impl JobSender {
    /// Jobs waiting or running, including the one in progress.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queues `item` and returns its 1-based position.
    pub fn enqueue(&self, item: QueueItem) -> Result<usize, JobError> {
        let position = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let (id, kind) = (item.id, item.kind);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(JobError::Internal("job queue is closed".to_string()));
        }
        tracing::info!(job_id = %id, %kind, position, "job enqueued");
        Ok(position)
    }

    pub fn enqueue_generate(&self, context: JobContext, params: JobParams) -> Result<usize, JobError> {
        if !(1..=MAX_COUNT).contains(&params.count) {
            return Err(JobError::Validation(format!(
                "count must be between 1 and {MAX_COUNT}"
            )));
        }
        if !params.sources.is_empty() || params.mask.is_some() {
            return Err(JobError::Validation(
                "generate does not take source images".to_string(),
            ));
        }
        self.enqueue(QueueItem::new(JobKind::Generate, context, params))
    }

    pub fn enqueue_edit(&self, context: JobContext, params: JobParams) -> Result<usize, JobError> {
        if !(1..=EDIT_SOURCES_MAX).contains(&params.sources.len()) {
            return Err(JobError::Validation(format!(
                "edit takes 1-{EDIT_SOURCES_MAX} source images, got {}",
                params.sources.len()
            )));
        }
        self.enqueue(QueueItem::new(JobKind::Edit, context, params))
    }

    pub fn enqueue_blend(&self, context: JobContext, params: JobParams) -> Result<usize, JobError> {
        if !(BLEND_SOURCES_MIN..=BLEND_SOURCES_MAX).contains(&params.sources.len()) {
            return Err(JobError::Validation(format!(
                "blend takes {BLEND_SOURCES_MIN}-{BLEND_SOURCES_MAX} source images, got {}",
                params.sources.len()
            )));
        }
        let strength = params.strength.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&strength) {
            return Err(JobError::Validation(
                "strength must be between 0.0 and 1.0".to_string(),
            ));
        }
        self.enqueue(QueueItem::new(JobKind::Blend, context, params))
    }

    pub fn enqueue_job(
        &self,
        kind: JobKind,
        context: JobContext,
        params: JobParams,
    ) -> Result<usize, JobError> {
        match kind {
            JobKind::Generate => self.enqueue_generate(context, params),
            JobKind::Edit => self.enqueue_edit(context, params),
            JobKind::Blend => self.enqueue_blend(context, params),
        }
    }
}

pub struct JobWorker {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    processor: Arc<dyn JobProcessor>,
    pending: Arc<AtomicUsize>,
    options: WorkerOptions,
}

impl JobWorker {
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Consumes jobs until shutdown or until every sender is gone. On
    /// shutdown, jobs still waiting are failed instead of dropped.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.cancel_waiting().await;
                    break;
                }
                item = self.rx.recv() => match item {
                    Some(item) => self.process_one(item).await,
                    None => break,
                },
            }
        }
        tracing::info!("job worker stopped");
    }

    /// Takes the next waiting job without running it.
    #[cfg(test)]
    pub(crate) fn take_waiting(&mut self) -> Option<QueueItem> {
        self.rx.try_recv().ok()
    }

    async fn cancel_waiting(&mut self) {
        self.rx.close();
        let mut cancelled = 0usize;
        while let Ok(item) = self.rx.try_recv() {
            let mut progress = ProgressReporter::new(
                &item.context,
                item.kind,
                &item.params.prompt,
                Duration::ZERO,
            );
            progress.abandon(SHUTDOWN_MESSAGE).await;
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::info!(job_id = %item.id, kind = %item.kind, "queued job cancelled by shutdown");
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::warn!(cancelled, "shutdown cancelled queued jobs");
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(job_id = %item.id, kind = %item.kind, user_id = %item.context.user_id)
    )]
    async fn process_one(&self, item: QueueItem) {
        let waited_ms = (Utc::now() - item.enqueued_at).num_milliseconds();
        tracing::info!(waited_ms, "job started");

        let mut temp = TempResources::new(self.options.temp_root.join(item.id.to_string()));
        let mut progress = ProgressReporter::new(
            &item.context,
            item.kind,
            &item.params.prompt,
            self.options.progress_step_delay,
        );
        progress.start().await;

        let result = self.run_guarded(&item, &mut temp, &mut progress).await;
        match result {
            Ok(()) if progress.is_terminal() => tracing::info!("job finished"),
            Ok(()) => {
                tracing::error!("job returned without reaching a terminal state");
                progress
                    .fail(&JobError::Internal(String::new()).user_message())
                    .await;
            }
            Err(error) => {
                match &error {
                    JobError::Internal(_) => tracing::error!(%error, "job failed"),
                    _ => tracing::warn!(%error, category = ?error.category(), "job failed"),
                }
                progress.fail(&error.user_message()).await;
            }
        }

        temp.release_all();
        remove_job_dir(temp.dir()).await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs the processor with panic capture and the optional job timeout.
    async fn run_guarded(
        &self,
        item: &QueueItem,
        temp: &mut TempResources,
        progress: &mut ProgressReporter,
    ) -> Result<(), JobError> {
        let guarded = AssertUnwindSafe(self.processor.process(item, temp, progress)).catch_unwind();
        let outcome = match self.options.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(JobError::TimedOut(limit)),
            },
            None => guarded.await,
        };
        outcome.unwrap_or_else(|payload| {
            Err(JobError::Internal(format!(
                "job panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }
}

async fn remove_job_dir(dir: &std::path::Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %dir.display(), %e, "failed to remove job dir"),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

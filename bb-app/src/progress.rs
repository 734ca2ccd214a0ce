//! One status message per job, edited in place as the job moves forward.

use crate::error::JobError;
use crate::queue::{JobContext, JobKind};
use bb_channels::{ChannelAdapter, MessageAction, MessageId, OutboundMessage};
use std::sync::Arc;
use std::time::Duration;

const PROMPT_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Queued,
    Processing,
    Generating,
    Editing,
    Blending,
    Finalizing,
    Complete,
    Failed,
}

impl ProgressState {
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Processing => 1,
            Self::Generating | Self::Editing | Self::Blending => 2,
            Self::Finalizing => 3,
            Self::Complete | Self::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Processing => "Processing",
            Self::Generating => "Generating",
            Self::Editing => "Editing",
            Self::Blending => "Blending",
            Self::Finalizing => "Finalizing",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }

    fn icon(self) -> &'static str {
        match self {
            Self::Queued => "⏳",
            Self::Processing => "🔄",
            Self::Generating => "🎨",
            Self::Editing => "✏️",
            Self::Blending => "🌀",
            Self::Finalizing => "🔧",
            Self::Complete => "✅",
            Self::Failed => "❌",
        }
    }
}

pub struct ProgressReporter {
    channel: Arc<dyn ChannelAdapter>,
    recipient: String,
    reply_to: Option<MessageId>,
    message_id: Option<MessageId>,
    kind: JobKind,
    prompt: String,
    state: ProgressState,
    /// Last non-terminal state, shown as the failed stage.
    reached: ProgressState,
    step_delay: Duration,
    outcome: Option<String>,
    actions: Vec<MessageAction>,
}

impl ProgressReporter {
    pub fn new(context: &JobContext, kind: JobKind, prompt: &str, step_delay: Duration) -> Self {
        Self {
            channel: context.channel.clone(),
            recipient: context.recipient.clone(),
            reply_to: context.reply_to.clone(),
            message_id: None,
            kind,
            prompt: prompt.to_string(),
            state: ProgressState::Queued,
            reached: ProgressState::Queued,
            step_delay,
            outcome: None,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> ProgressState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.message_id.as_ref()
    }

    /// Posts the status message in its initial state. This is the only
    /// place a progress message is sent; later transitions edit it.
    pub async fn start(&mut self) {
        self.post().await;
    }

    /// Fails a job that never started: posts the failed status in one
    /// message instead of sending and then editing.
    pub async fn abandon(&mut self, reason: &str) {
        if self.message_id.is_some() || self.is_terminal() {
            self.fail(reason).await;
            return;
        }
        self.state = ProgressState::Failed;
        self.outcome = Some(format!("**Failed**\n{reason}"));
        self.actions.clear();
        self.post().await;
    }

    /// Moves to a later non-terminal state. Going backwards, staying put, or
    /// entering another kind's working state is an internal error.
    pub async fn advance(&mut self, next: ProgressState) -> Result<(), JobError> {
        if next.is_terminal() {
            return Err(JobError::Internal(format!(
                "{next:?} is reached through complete or fail"
            )));
        }
        if next.rank() == 2 && next != self.kind.working_state() {
            return Err(JobError::Internal(format!(
                "{next:?} is not a stage of a {} job",
                self.kind
            )));
        }
        if next.rank() <= self.state.rank() {
            return Err(JobError::Internal(format!(
                "progress cannot move from {:?} to {next:?}",
                self.state
            )));
        }
        tracing::debug!(from = ?self.state, to = ?next, "progress advanced");
        self.state = next;
        self.reached = next;
        self.deliver().await;
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
        Ok(())
    }

    /// Terminal success; `actions` become buttons on the status message.
    pub async fn complete(
        &mut self,
        produced: usize,
        actions: Vec<MessageAction>,
    ) -> Result<(), JobError> {
        if self.is_terminal() {
            return Err(JobError::Internal(format!(
                "progress already {:?}",
                self.state
            )));
        }
        self.state = ProgressState::Complete;
        self.outcome = Some(format!(
            "**Complete!** {} {produced} image(s)",
            self.kind.verb()
        ));
        self.actions = actions;
        self.deliver().await;
        Ok(())
    }

    /// Terminal failure. A job that already finished keeps its final state.
    pub async fn fail(&mut self, reason: &str) {
        if self.is_terminal() {
            tracing::debug!(state = ?self.state, reason, "ignoring fail on finished job");
            return;
        }
        self.state = ProgressState::Failed;
        self.outcome = Some(format!("**Failed**\n{reason}"));
        self.actions.clear();
        self.deliver().await;
    }

    pub fn render(&self) -> String {
        let working = self.kind.working_state();
        let failed = self.state == ProgressState::Failed;
        let current = if failed { self.reached } else { self.state };
        let stages = [
            ProgressState::Queued,
            ProgressState::Processing,
            working,
            ProgressState::Finalizing,
        ];
        let line = stages
            .iter()
            .map(|stage| {
                if self.state == ProgressState::Complete || stage.rank() < current.rank() {
                    format!("✅ {}", stage.label())
                } else if *stage == current && failed {
                    format!("❌ {}", stage.label())
                } else if *stage == current {
                    format!("**{} {}**", stage.icon(), stage.label())
                } else {
                    format!("{} {}", stage.icon(), stage.label())
                }
            })
            .collect::<Vec<_>>()
            .join(" → ");

        let mut out = format!("**{}**\n{line}", self.kind.title());
        if let Some(outcome) = &self.outcome {
            out.push_str("\n\n");
            out.push_str(outcome);
        }
        out.push_str("\n\n**Prompt:** ");
        out.push_str(&prompt_preview(&self.prompt));
        out
    }

    fn message(&self) -> OutboundMessage {
        OutboundMessage::text(self.render()).with_actions(self.actions.clone())
    }

    async fn post(&mut self) {
        if self.message_id.is_some() {
            return;
        }
        let message = self.message().replying_to(self.reply_to.clone());
        match self.channel.send(&self.recipient, message).await {
            Ok(id) => self.message_id = Some(id),
            Err(e) => tracing::warn!(%e, state = ?self.state, "failed to send progress message"),
        }
    }

    /// Edits the status message. Without one there is nothing to update.
    async fn deliver(&mut self) {
        let Some(id) = &self.message_id else {
            tracing::debug!(state = ?self.state, "no progress message to edit");
            return;
        };
        if let Err(e) = self.channel.edit(&self.recipient, id, self.message()).await {
            tracing::warn!(%e, state = ?self.state, "failed to edit progress message");
        }
    }
}

pub fn prompt_preview(prompt: &str) -> String {
    if prompt.chars().count() > PROMPT_PREVIEW_CHARS {
        let head: String = prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        format!("{head}...")
    } else {
        prompt.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingChannel, test_context};

    fn reporter(channel: &Arc<RecordingChannel>, kind: JobKind) -> ProgressReporter {
        ProgressReporter::new(
            &test_context(channel, "u1"),
            kind,
            "a banana wearing sunglasses",
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn all_transitions_edit_the_same_message() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Generate);
        progress.start().await;
        progress.advance(ProgressState::Processing).await.expect("processing");
        progress.advance(ProgressState::Generating).await.expect("generating");
        progress.advance(ProgressState::Finalizing).await.expect("finalizing");
        progress
            .complete(
                2,
                vec![MessageAction {
                    label: "🔄 Reroll".to_string(),
                    custom_id: "bb:1".to_string(),
                }],
            )
            .await
            .expect("complete");

        assert_eq!(channel.sent_count(), 1);
        assert_eq!(channel.edit_count(), 4);
        let id = progress.message_id().expect("posted").clone();
        assert!(channel.edited_ids().iter().all(|edited| *edited == id));
        let last = channel.last_edit().expect("edited");
        assert!(last.content.contains("✅ Queued → ✅ Processing → ✅ Generating → ✅ Finalizing"));
        assert!(last.content.contains("**Complete!** Generated 2 image(s)"));
        assert_eq!(last.actions.len(), 1);
    }

    #[tokio::test]
    async fn lost_initial_message_is_never_resent() {
        let channel = Arc::new(RecordingChannel::default());
        channel.reject_sends(true);
        let mut progress = reporter(&channel, JobKind::Generate);
        progress.start().await;
        assert!(progress.message_id().is_none());

        channel.reject_sends(false);
        progress.advance(ProgressState::Processing).await.expect("processing");
        progress.advance(ProgressState::Generating).await.expect("generating");
        progress.fail("❌ Processing failed: boom").await;

        assert_eq!(channel.sent_count(), 0);
        assert_eq!(channel.edit_count(), 0);
        assert!(progress.is_terminal());
    }

    #[tokio::test]
    async fn abandoned_job_posts_one_failed_message() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Blend);
        progress.abandon("❌ Shutting down").await;

        assert_eq!(channel.sent_count(), 1);
        assert_eq!(channel.edit_count(), 0);
        let (_, msg) = channel.sent().pop().expect("sent");
        assert!(msg.content.contains("❌ Queued"));
        assert!(msg.content.contains("**Failed**\n❌ Shutting down"));
        assert_eq!(msg.reply_to_message_id, Some(MessageId::new("cmd-1")));
    }

    #[tokio::test]
    async fn transitions_are_forward_only() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Edit);
        progress.start().await;
        progress.advance(ProgressState::Editing).await.expect("skip ahead");
        assert!(progress.advance(ProgressState::Processing).await.is_err());
        assert!(progress.advance(ProgressState::Editing).await.is_err());
        assert!(progress.advance(ProgressState::Complete).await.is_err());
        assert_eq!(progress.state(), ProgressState::Editing);
    }

    #[tokio::test]
    async fn working_state_must_match_the_job_kind() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Blend);
        progress.start().await;
        assert!(progress.advance(ProgressState::Generating).await.is_err());
        progress.advance(ProgressState::Blending).await.expect("blending");
    }

    #[tokio::test]
    async fn fail_after_complete_keeps_the_completed_state() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Generate);
        progress.start().await;
        progress.complete(1, Vec::new()).await.expect("complete");
        progress.fail("late failure").await;
        assert_eq!(progress.state(), ProgressState::Complete);
        assert!(progress.complete(1, Vec::new()).await.is_err());
        assert_eq!(channel.edit_count(), 1);
    }

    #[tokio::test]
    async fn failure_marks_current_stage_and_shows_reason() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Generate);
        progress.start().await;
        progress.advance(ProgressState::Processing).await.expect("processing");
        progress.fail("❌ Processing failed: no images").await;
        let content = channel.last_edit().expect("edited").content;
        assert!(content.contains("✅ Queued → ❌ Processing → 🎨 Generating"));
        assert!(content.contains("**Failed**\n❌ Processing failed: no images"));
        assert!(progress.is_terminal());
    }

    #[test]
    fn long_prompts_are_truncated_in_the_status() {
        let prompt = "x".repeat(150);
        let preview = prompt_preview(&prompt);
        assert_eq!(preview.chars().count(), 103);
        assert!(preview.ends_with("..."));
        assert_eq!(prompt_preview("short"), "short");
    }

    #[tokio::test]
    async fn first_message_replies_to_the_command() {
        let channel = Arc::new(RecordingChannel::default());
        let mut progress = reporter(&channel, JobKind::Generate);
        progress.start().await;
        let (_, first) = channel.sent().into_iter().next().expect("sent");
        assert_eq!(first.reply_to_message_id, Some(MessageId::new("cmd-1")));
        assert!(first.content.starts_with("**🎨 Image Generation Progress**"));
        assert!(progress.message_id().is_some());
    }
}

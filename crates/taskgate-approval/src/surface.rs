use async_trait::async_trait;
use taskgate_domain::{ApprovalPrompt, ApprovalTimeoutNotice, RequesterChannel};
use tokio::sync::mpsc;

use crate::ApprovalError;

/// Whoever answers approval prompts: a chat bridge, a terminal, a test harness.
#[async_trait]
pub trait ApprovalSurface: Send + Sync {
    /// # Errors
    /// Returns an error when the prompt cannot reach the requester.
    async fn send_prompt(
        &self,
        requester: &RequesterChannel,
        prompt: &ApprovalPrompt,
    ) -> Result<(), ApprovalError>;

    /// # Errors
    /// Returns an error when the notice cannot reach the requester.
    async fn send_timeout(
        &self,
        requester: &RequesterChannel,
        notice: &ApprovalTimeoutNotice,
    ) -> Result<(), ApprovalError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceMessage {
    Prompt {
        requester: RequesterChannel,
        prompt: ApprovalPrompt,
    },
    TimedOut {
        requester: RequesterChannel,
        notice: ApprovalTimeoutNotice,
    },
}

/// Hands prompts and notices to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelApprovalSurface {
    sender: mpsc::UnboundedSender<SurfaceMessage>,
}

impl ChannelApprovalSurface {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SurfaceMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn push(&self, message: SurfaceMessage) -> Result<(), ApprovalError> {
        self.sender
            .send(message)
            .map_err(|_| ApprovalError::SurfaceClosed)
    }
}

#[async_trait]
impl ApprovalSurface for ChannelApprovalSurface {
    async fn send_prompt(
        &self,
        requester: &RequesterChannel,
        prompt: &ApprovalPrompt,
    ) -> Result<(), ApprovalError> {
        self.push(SurfaceMessage::Prompt {
            requester: requester.clone(),
            prompt: prompt.clone(),
        })
    }

    async fn send_timeout(
        &self,
        requester: &RequesterChannel,
        notice: &ApprovalTimeoutNotice,
    ) -> Result<(), ApprovalError> {
        self.push(SurfaceMessage::TimedOut {
            requester: requester.clone(),
            notice: notice.clone(),
        })
    }
}

/// No operator attached. Every prompt fails to deliver, so prompted requests are denied.
#[derive(Debug, Clone, Default)]
pub struct DetachedApprovalSurface;

#[async_trait]
impl ApprovalSurface for DetachedApprovalSurface {
    async fn send_prompt(
        &self,
        _requester: &RequesterChannel,
        _prompt: &ApprovalPrompt,
    ) -> Result<(), ApprovalError> {
        Err(ApprovalError::NoOperator)
    }

    async fn send_timeout(
        &self,
        _requester: &RequesterChannel,
        _notice: &ApprovalTimeoutNotice,
    ) -> Result<(), ApprovalError> {
        Ok(())
    }
}

//! Confirmation capability for blocks that need a human decision

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::parser::CodeBlock;

/// A block waiting for approval
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequest {
    pub conversation: String,
    pub block: CodeBlock,
    /// Why the gate asked
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationVerdict {
    Approve,
    Deny { reason: Option<String> },
}

/// Result of a bounded confirmation wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Approved,
    Denied(String),
    TimedOut,
}

/// Asks someone whether a block may run
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> ConfirmationVerdict;
}

/// Approves every request
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(&self, _request: &ConfirmationRequest) -> ConfirmationVerdict {
        ConfirmationVerdict::Approve
    }
}

/// Denies every request
pub struct AutoDeny;

#[async_trait]
impl Confirmer for AutoDeny {
    async fn confirm(&self, _request: &ConfirmationRequest) -> ConfirmationVerdict {
        ConfirmationVerdict::Deny {
            reason: Some("confirmation is not available".to_string()),
        }
    }
}

/// A request handed to the surrounding application
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    reply: oneshot::Sender<ConfirmationVerdict>,
}

impl PendingConfirmation {
    pub fn approve(self) {
        let _ = self.reply.send(ConfirmationVerdict::Approve);
    }

    pub fn deny(self, reason: Option<String>) {
        let _ = self.reply.send(ConfirmationVerdict::Deny { reason });
    }
}

/// Forwards requests over a channel and waits for the reply
///
/// A dropped receiver or an unanswered request counts as a denial.
#[derive(Clone)]
pub struct ChannelConfirmer {
    sender: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmer {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Confirmer for ChannelConfirmer {
    async fn confirm(&self, request: &ConfirmationRequest) -> ConfirmationVerdict {
        let (reply, response) = oneshot::channel();
        let pending = PendingConfirmation {
            request: request.clone(),
            reply,
        };
        if self.sender.send(pending).await.is_err() {
            warn!("Confirmation channel closed, denying block");
            return ConfirmationVerdict::Deny {
                reason: Some("nobody is listening for confirmations".to_string()),
            };
        }
        response.await.unwrap_or(ConfirmationVerdict::Deny {
            reason: Some("confirmation was dropped".to_string()),
        })
    }
}

/// Ask `confirmer`, treating a wait longer than `timeout` as a denial
pub async fn confirm_with_timeout(
    confirmer: &dyn Confirmer,
    request: &ConfirmationRequest,
    timeout: Duration,
) -> ConfirmationOutcome {
    match tokio::time::timeout(timeout, confirmer.confirm(request)).await {
        Ok(ConfirmationVerdict::Approve) => ConfirmationOutcome::Approved,
        Ok(ConfirmationVerdict::Deny { reason }) => {
            ConfirmationOutcome::Denied(reason.unwrap_or_else(|| "denied by user".to_string()))
        }
        Err(_) => ConfirmationOutcome::TimedOut,
    }
}

#![forbid(unsafe_code)]

//! Approval handshake for tool calls that need a human decision.
//!
//! A request registers a pending entry keyed by a fresh [`RequestId`], prompts
//! the requester through an [`ApprovalSurface`] and suspends only the calling
//! task until a matching response or the timeout arrives. Whichever of the two
//! removes the pending entry first decides the outcome.

mod surface;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskgate_domain::{
    now_utc, ApprovalOutcome, ApprovalRequest, ApprovalResponse, RequestId, RequesterChannel,
    RunId,
};
use tokio::sync::oneshot;

pub use surface::{ApprovalSurface, ChannelApprovalSurface, DetachedApprovalSurface, SurfaceMessage};

pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ApprovalError {
    #[error("approval surface closed")]
    SurfaceClosed,
    #[error("no operator attached to answer approval prompts")]
    NoOperator,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Prompt,
    AutoApprove,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ApprovalConfig {
    pub mode: ApprovalMode,
    pub timeout_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Prompt,
            timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
        }
    }
}

impl ApprovalConfig {
    #[must_use]
    pub fn auto_approve() -> Self {
        Self {
            mode: ApprovalMode::AutoApprove,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RespondOutcome {
    Resolved,
    /// No pending entry for the id: never issued, already answered or already timed out.
    Unknown,
    OriginMismatch,
}

struct PendingApproval {
    requester: RequesterChannel,
    tool_name: String,
    resolver: oneshot::Sender<ApprovalOutcome>,
}

pub struct ApprovalGate {
    config: ApprovalConfig,
    surface: Arc<dyn ApprovalSurface>,
    pending: Mutex<HashMap<RequestId, PendingApproval>>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(config: ApprovalConfig, surface: Arc<dyn ApprovalSurface>) -> Self {
        Self {
            config,
            surface,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Gate that approves everything without an operator.
    #[must_use]
    pub fn auto_approve() -> Self {
        Self::new(
            ApprovalConfig::auto_approve(),
            Arc::new(DetachedApprovalSurface),
        )
    }

    #[must_use]
    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Whether `request_id` is still waiting for an answer.
    #[must_use]
    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.lock_pending().contains_key(request_id)
    }

    /// Ask `requester` whether `tool_name` may run with `args`.
    ///
    /// Only the awaiting task is suspended. In `AutoApprove` mode this returns
    /// immediately and never touches the pending table or the surface.
    pub async fn request_approval(
        &self,
        tool_name: &str,
        args: &Value,
        run_id: Option<RunId>,
        requester: &RequesterChannel,
    ) -> ApprovalOutcome {
        if self.config.mode == ApprovalMode::AutoApprove {
            tracing::debug!(tool = tool_name, "approval granted by auto-approve mode");
            return ApprovalOutcome::Approved;
        }

        let request = ApprovalRequest {
            request_id: RequestId::new(),
            run_id,
            tool_name: tool_name.to_string(),
            args: args.clone(),
            requester: requester.clone(),
            created_at: now_utc(),
            timeout_ms: self.config.timeout_ms,
        };
        let (resolver, mut receiver) = oneshot::channel();
        self.lock_pending().insert(
            request.request_id,
            PendingApproval {
                requester: requester.clone(),
                tool_name: request.tool_name.clone(),
                resolver,
            },
        );
        tracing::info!(
            request_id = %request.request_id,
            tool = tool_name,
            requester = %requester,
            timeout_ms = request.timeout_ms,
            "approval requested"
        );

        if let Err(err) = self.surface.send_prompt(requester, &request.prompt()).await {
            let withdrawn = self.lock_pending().remove(&request.request_id).is_some();
            if withdrawn {
                tracing::warn!(
                    request_id = %request.request_id,
                    tool = tool_name,
                    error = %err,
                    "approval prompt not delivered; denying"
                );
                return ApprovalOutcome::Denied {
                    reason: format!("approval prompt not delivered: {err}"),
                };
            }
            // A response already claimed the entry.
            return settle(receiver.await);
        }

        match tokio::time::timeout(self.config.timeout(), &mut receiver).await {
            Ok(resolved) => settle(resolved),
            Err(_) => {
                let claimed_by_responder = self.lock_pending().remove(&request.request_id).is_none();
                if claimed_by_responder {
                    return settle(receiver.await);
                }
                tracing::warn!(
                    request_id = %request.request_id,
                    tool = tool_name,
                    "approval window closed without a response"
                );
                self.notify_timeout(&request);
                ApprovalOutcome::TimedOut
            }
        }
    }

    /// Deliver a human decision. Only the original requester may resolve a request,
    /// and each request resolves at most once.
    pub fn respond(&self, origin: &RequesterChannel, response: ApprovalResponse) -> RespondOutcome {
        let mut pending = self.lock_pending();
        let Some(entry) = pending.get(&response.request_id) else {
            tracing::debug!(request_id = %response.request_id, "response for unknown approval request ignored");
            return RespondOutcome::Unknown;
        };
        if entry.requester != *origin {
            tracing::debug!(
                request_id = %response.request_id,
                origin = %origin,
                "response from foreign origin ignored"
            );
            return RespondOutcome::OriginMismatch;
        }
        let Some(entry) = pending.remove(&response.request_id) else {
            return RespondOutcome::Unknown;
        };

        let outcome = if response.approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied {
                reason: response
                    .reason
                    .unwrap_or_else(|| "denied by operator".to_string()),
            }
        };
        tracing::info!(
            request_id = %response.request_id,
            tool = %entry.tool_name,
            approved = response.approved,
            "approval resolved"
        );
        if entry.resolver.send(outcome).is_err() {
            tracing::debug!(request_id = %response.request_id, "approval waiter already gone");
        }
        RespondOutcome::Resolved
    }

    fn notify_timeout(&self, request: &ApprovalRequest) {
        let surface = Arc::clone(&self.surface);
        let requester = request.requester.clone();
        let notice = request.timeout_notice();
        tokio::spawn(async move {
            if let Err(err) = surface.send_timeout(&requester, &notice).await {
                tracing::warn!(request_id = %notice.request_id, error = %err, "timeout notice not delivered");
            }
        });
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingApproval>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn settle(resolved: Result<ApprovalOutcome, oneshot::error::RecvError>) -> ApprovalOutcome {
    resolved.unwrap_or_else(|_| ApprovalOutcome::Denied {
        reason: "approval request dropped".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use taskgate_domain::{ApprovalOutcome, ApprovalResponse, RequestId, RequesterChannel};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::{
        ApprovalConfig, ApprovalGate, ChannelApprovalSurface, RespondOutcome, SurfaceMessage,
    };

    fn prompted_gate(timeout_ms: u64) -> (Arc<ApprovalGate>, UnboundedReceiver<SurfaceMessage>) {
        let (surface, receiver) = ChannelApprovalSurface::new();
        let gate = ApprovalGate::new(
            ApprovalConfig::default().with_timeout_ms(timeout_ms),
            Arc::new(surface),
        );
        (Arc::new(gate), receiver)
    }

    async fn next_prompt_id(receiver: &mut UnboundedReceiver<SurfaceMessage>) -> RequestId {
        match receiver.recv().await {
            Some(SurfaceMessage::Prompt { prompt, .. }) => prompt.request_id,
            other => panic!("expected a prompt, got {other:?}"),
        }
    }

    fn answer(request_id: RequestId, approved: bool) -> ApprovalResponse {
        ApprovalResponse {
            request_id,
            approved,
            reason: None,
        }
    }

    #[tokio::test]
    async fn auto_approve_never_registers_or_prompts() {
        let (surface, mut receiver) = ChannelApprovalSurface::new();
        let gate = ApprovalGate::new(ApprovalConfig::auto_approve(), Arc::new(surface));

        let outcome = gate
            .request_approval("shell_exec", &json!({"cmd": "ls"}), None, &RequesterChannel::default())
            .await;

        assert_eq!(outcome, ApprovalOutcome::Approved);
        assert_eq!(gate.pending_count(), 0);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn approval_response_resolves_waiter() {
        let (gate, mut receiver) = prompted_gate(30_000);
        let requester = RequesterChannel::new("chat:1");

        let waiter = {
            let gate = Arc::clone(&gate);
            let requester = requester.clone();
            tokio::spawn(async move {
                gate.request_approval("send_email", &json!({"to": "a@b.c"}), None, &requester)
                    .await
            })
        };

        let request_id = next_prompt_id(&mut receiver).await;
        assert_eq!(gate.pending_count(), 1);
        assert!(gate.is_pending(&request_id));
        assert_eq!(gate.respond(&requester, answer(request_id, true)), RespondOutcome::Resolved);
        assert!(!gate.is_pending(&request_id));

        let outcome = waiter.await.unwrap_or_else(|_| unreachable!());
        assert_eq!(outcome, ApprovalOutcome::Approved);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn denial_carries_operator_reason() {
        let (gate, mut receiver) = prompted_gate(30_000);
        let requester = RequesterChannel::new("chat:2");

        let waiter = {
            let gate = Arc::clone(&gate);
            let requester = requester.clone();
            tokio::spawn(async move {
                gate.request_approval("payment_submit", &json!({}), None, &requester)
                    .await
            })
        };

        let request_id = next_prompt_id(&mut receiver).await;
        let response = ApprovalResponse {
            request_id,
            approved: false,
            reason: Some("not today".to_string()),
        };
        assert_eq!(gate.respond(&requester, response), RespondOutcome::Resolved);

        let outcome = waiter.await.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            outcome,
            ApprovalOutcome::Denied {
                reason: "not today".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_and_notifies() {
        let (gate, mut receiver) = prompted_gate(30_000);
        let requester = RequesterChannel::new("chat:3");

        let outcome = gate
            .request_approval("write_file", &json!({"path": "/tmp/x"}), None, &requester)
            .await;
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
        assert_eq!(gate.pending_count(), 0);

        let request_id = next_prompt_id(&mut receiver).await;
        assert!(!gate.is_pending(&request_id));
        match receiver.recv().await {
            Some(SurfaceMessage::TimedOut { notice, requester: to }) => {
                assert_eq!(notice.request_id, request_id);
                assert_eq!(notice.tool_name, "write_file");
                assert_eq!(to, requester);
            }
            other => panic!("expected a timeout notice, got {other:?}"),
        }

        // The window is closed; a late answer changes nothing.
        assert_eq!(gate.respond(&requester, answer(request_id, true)), RespondOutcome::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn response_from_other_origin_is_ignored() {
        let (gate, mut receiver) = prompted_gate(1_000);
        let requester = RequesterChannel::new("chat:owner");

        let waiter = {
            let gate = Arc::clone(&gate);
            let requester = requester.clone();
            tokio::spawn(async move {
                gate.request_approval("delete_file", &json!({}), None, &requester)
                    .await
            })
        };

        let request_id = next_prompt_id(&mut receiver).await;
        let intruder = RequesterChannel::new("chat:intruder");
        assert_eq!(
            gate.respond(&intruder, answer(request_id, true)),
            RespondOutcome::OriginMismatch
        );
        assert_eq!(gate.pending_count(), 1);

        let outcome = waiter.await.unwrap_or_else(|_| unreachable!());
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
    }

    #[tokio::test]
    async fn duplicate_response_is_a_no_op() {
        let (gate, mut receiver) = prompted_gate(30_000);
        let requester = RequesterChannel::default();

        let waiter = {
            let gate = Arc::clone(&gate);
            let requester = requester.clone();
            tokio::spawn(async move {
                gate.request_approval("shell_exec", &json!({}), None, &requester)
                    .await
            })
        };

        let request_id = next_prompt_id(&mut receiver).await;
        assert_eq!(gate.respond(&requester, answer(request_id, false)), RespondOutcome::Resolved);
        assert_eq!(gate.respond(&requester, answer(request_id, true)), RespondOutcome::Unknown);

        let outcome = waiter.await.unwrap_or_else(|_| unreachable!());
        assert!(matches!(outcome, ApprovalOutcome::Denied { .. }));
    }

    #[tokio::test]
    async fn undeliverable_prompt_fails_closed() {
        let (surface, receiver) = ChannelApprovalSurface::new();
        drop(receiver);
        let gate = ApprovalGate::new(ApprovalConfig::default(), Arc::new(surface));

        let outcome = gate
            .request_approval("send_email", &json!({}), None, &RequesterChannel::default())
            .await;
        assert!(matches!(outcome, ApprovalOutcome::Denied { reason } if reason.contains("not delivered")));
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timeout_and_late_response_resolve_exactly_once() {
        for round in 0..40_u64 {
            let (gate, mut receiver) = prompted_gate(5);
            let requester = RequesterChannel::new(format!("chat:{round}"));

            let waiter = {
                let gate = Arc::clone(&gate);
                let requester = requester.clone();
                tokio::spawn(async move {
                    gate.request_approval("shell_exec", &json!({}), None, &requester)
                        .await
                })
            };

            let request_id = next_prompt_id(&mut receiver).await;
            tokio::time::sleep(Duration::from_millis(round % 8)).await;
            let responded = gate.respond(&requester, answer(request_id, true));
            let outcome = waiter.await.unwrap_or_else(|_| unreachable!());

            match responded {
                RespondOutcome::Resolved => assert_eq!(outcome, ApprovalOutcome::Approved),
                RespondOutcome::Unknown => assert_eq!(outcome, ApprovalOutcome::TimedOut),
                RespondOutcome::OriginMismatch => panic!("origin matched"),
            }
            assert_eq!(gate.pending_count(), 0);
        }
    }
}

use std::io::BufRead;
use std::sync::Arc;

use taskgate_approval::{ApprovalGate, RespondOutcome, SurfaceMessage};
use taskgate_domain::{ApprovalPrompt, ApprovalResponse, RequesterChannel};
use tokio::sync::mpsc;

/// Answers approval prompts from the terminal, one at a time, until the gate goes away.
pub async fn answer_prompts(gate: Arc<ApprovalGate>, messages: mpsc::UnboundedReceiver<SurfaceMessage>) {
    serve(gate, messages, spawn_stdin_reader).await;
}

/// `open_lines` runs on the first prompt that is still live.
async fn serve(
    gate: Arc<ApprovalGate>,
    mut messages: mpsc::UnboundedReceiver<SurfaceMessage>,
    open_lines: impl FnOnce() -> mpsc::UnboundedReceiver<String>,
) {
    let mut open_lines = Some(open_lines);
    let mut lines: Option<mpsc::UnboundedReceiver<String>> = None;

    while let Some(message) = messages.recv().await {
        match message {
            SurfaceMessage::Prompt { requester, prompt } => {
                // Prompts queue while an earlier one waits on stdin and may expire meanwhile.
                if !gate.is_pending(&prompt.request_id) {
                    eprintln!(
                        "Skipping expired request {} for {}.",
                        prompt.request_id, prompt.tool_name
                    );
                    continue;
                }
                if lines.is_none() {
                    lines = open_lines.take().map(|open| open());
                }
                let Some(lines) = lines.as_mut() else {
                    continue;
                };
                ask(&gate, lines, &requester, &prompt).await;
            }
            SurfaceMessage::TimedOut { notice, .. } => {
                eprintln!(
                    "Approval window for {} ({}) closed without an answer.",
                    notice.tool_name, notice.request_id
                );
            }
        }
    }
}

async fn ask(
    gate: &ApprovalGate,
    lines: &mut mpsc::UnboundedReceiver<String>,
    requester: &RequesterChannel,
    prompt: &ApprovalPrompt,
) {
    let args = serde_json::to_string_pretty(&prompt.args).unwrap_or_else(|_| prompt.args.to_string());
    eprintln!(
        "Tool '{}' needs approval (expires in {}ms):\n{args}",
        prompt.tool_name, prompt.timeout_ms
    );
    eprint!("Approve request {}? [y/N]: ", prompt.request_id);

    let Some(answer) = lines.recv().await else {
        eprintln!("stdin closed; request {} will time out.", prompt.request_id);
        return;
    };
    let approved = is_yes(&answer);
    let response = ApprovalResponse {
        request_id: prompt.request_id,
        approved,
        reason: (!approved).then(|| "rejected at terminal".to_string()),
    };

    if gate.respond(requester, response) == RespondOutcome::Unknown {
        eprintln!("Request {} is no longer pending.", prompt.request_id);
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Reads stdin on a plain thread so an unanswered prompt never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (sender, receiver) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use taskgate_approval::{ApprovalConfig, ApprovalGate, ChannelApprovalSurface};
    use taskgate_domain::{ApprovalOutcome, RequesterChannel};
    use tokio::sync::mpsc;

    use super::{is_yes, serve};

    #[test]
    fn only_yes_approves() {
        assert!(is_yes("y"));
        assert!(is_yes(" YES \n"));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_prompts_are_skipped_so_answers_reach_live_ones() {
        let (surface, messages) = ChannelApprovalSurface::new();
        let gate = Arc::new(ApprovalGate::new(
            ApprovalConfig::default().with_timeout_ms(1_000),
            Arc::new(surface),
        ));
        let requester = RequesterChannel::new("terminal");

        let expired = gate
            .request_approval("shell_exec", &json!({"cmd": "ls"}), None, &requester)
            .await;
        assert_eq!(expired, ApprovalOutcome::TimedOut);

        let (answers, lines) = mpsc::unbounded_channel();
        assert!(answers.send("y".to_string()).is_ok());
        let operator = tokio::spawn(serve(Arc::clone(&gate), messages, move || lines));

        let live = gate
            .request_approval("send_email", &json!({"to": "ops@example.com"}), None, &requester)
            .await;
        operator.abort();

        assert_eq!(live, ApprovalOutcome::Approved);
        assert_eq!(gate.pending_count(), 0);
    }
}

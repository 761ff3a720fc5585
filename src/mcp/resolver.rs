//! Pending-call resolution.
//!
//! On every turn, before the conversation is replayed to the model, the
//! history is scanned for requested invocations of confirmation-gated tools
//! that now have a user decision. Approved calls execute once with their
//! original arguments; rejected calls resolve to a fixed denial text with no
//! remote call. Everything else is left pending for the UI to re-present.

use tracing::debug;

use crate::core::message::{Message, DENIAL_TEXT};
use crate::core::session::{ConfirmationOutcome, ConfirmationSignals};
use crate::mcp::executor::GatedExecutor;

/// One invocation newly resolved during the scan, for streaming back to the
/// client alongside model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionEvent {
    pub invocation_id: String,
    pub tool_name: String,
    pub result: String,
}

/// Scans `messages` in order and returns a patched copy of the history plus
/// the events for newly resolved invocations.
///
/// The scan is idempotent: already-resolved invocations are skipped, and a
/// stale signal for a resolved invocation is dropped without a remote call.
/// Invocations of tools outside the confirmation list are never inspected;
/// those resolve synchronously within the turn that requested them.
pub async fn resolve_pending(
    messages: &[Message],
    signals: &mut ConfirmationSignals,
    executor: &mut GatedExecutor<'_>,
) -> (Vec<Message>, Vec<ResolutionEvent>) {
    let mut patched = Vec::with_capacity(messages.len());
    let mut events = Vec::new();

    for message in messages {
        if message.tool_invocations.is_empty() {
            patched.push(message.clone());
            continue;
        }

        let mut updated = message.clone();
        for invocation in &mut updated.tool_invocations {
            if !executor.requires_confirmation(&invocation.tool_name) {
                continue;
            }

            if !invocation.is_pending() {
                // Terminal state; drop any stale signal without a call.
                signals.take(&invocation.id);
                continue;
            }

            let Some(outcome) = signals.take(&invocation.id) else {
                continue;
            };

            let result = match outcome {
                ConfirmationOutcome::Approved => {
                    debug!(
                        invocation_id = %invocation.id,
                        tool_name = %invocation.tool_name,
                        "Confirmation approved, executing tool"
                    );
                    executor.execute_confirmed(invocation).await
                }
                ConfirmationOutcome::Rejected => {
                    debug!(
                        invocation_id = %invocation.id,
                        tool_name = %invocation.tool_name,
                        "Confirmation rejected"
                    );
                    DENIAL_TEXT.to_string()
                }
            };

            events.push(ResolutionEvent {
                invocation_id: invocation.id.clone(),
                tool_name: invocation.tool_name.clone(),
                result: result.clone(),
            });
            *invocation = invocation.with_result(result);
        }
        patched.push(updated);
    }

    (patched, events)
}

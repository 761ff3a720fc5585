//! Per-user chat sessions and the confirmation signal surface.
//!
//! Each user is routed to an independent session instance; turns for one
//! session run sequentially because the driver takes the session by
//! exclusive borrow. Cross-session state is never shared.

use std::collections::HashMap;

use serde_json::Value;

use crate::core::message::{Message, ToolInvocation};

/// Name of the session-local tool answering from process-held state.
pub const GET_USER_INFO_TOOL: &str = "getUserInfo";

/// User decision for one pending invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Approved,
    Rejected,
}

/// Approve/reject signals keyed by invocation id, appended by the front end
/// and consumed by the pending-call resolver on the next turn.
#[derive(Debug, Default)]
pub struct ConfirmationSignals {
    outcomes: HashMap<String, ConfirmationOutcome>,
}

impl ConfirmationSignals {
    pub fn resolve(&mut self, invocation_id: impl Into<String>, outcome: ConfirmationOutcome) {
        self.outcomes.insert(invocation_id.into(), outcome);
    }

    /// Consumes the signal for one invocation, if present.
    pub fn take(&mut self, invocation_id: &str) -> Option<ConfirmationOutcome> {
        self.outcomes.remove(invocation_id)
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// One user's conversation: append-only history plus outstanding
/// confirmation signals.
#[derive(Debug, Default)]
pub struct ChatSession {
    pub user_name: Option<String>,
    pub messages: Vec<Message>,
    pub signals: ConfirmationSignals,
}

impl ChatSession {
    pub fn new(user_name: Option<String>) -> Self {
        Self {
            user_name,
            messages: Vec::new(),
            signals: ConfirmationSignals::default(),
        }
    }

    pub fn push_user_message(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    /// Records a user decision for a pending invocation.
    pub fn resolve(&mut self, invocation_id: impl Into<String>, outcome: ConfirmationOutcome) {
        self.signals.resolve(invocation_id, outcome);
    }

    /// Invocations still awaiting a user decision, in history order.
    pub fn pending_confirmations(&self) -> Vec<&ToolInvocation> {
        self.messages
            .iter()
            .flat_map(Message::pending_invocations)
            .collect()
    }

    pub fn has_pending_confirmations(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.pending_invocations().next().is_some())
    }

    /// Answers the session-local `getUserInfo` tool from process state.
    pub fn user_info_text(&self) -> String {
        format!(
            "The user's name is {}",
            self.user_name.as_deref().unwrap_or("unknown")
        )
    }
}

/// Routes each user to an independent session instance.
#[derive(Debug, Default)]
pub struct SessionRouter {
    sessions: HashMap<String, ChatSession>,
}

impl SessionRouter {
    pub fn session_for(&mut self, user_name: &str) -> &mut ChatSession {
        self.sessions
            .entry(user_name.to_string())
            .or_insert_with(|| ChatSession::new(Some(user_name.to_string())))
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }
}

/// Schema for the zero-argument session tool: an empty object.
pub fn user_info_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use serde_json::Map;

    #[test]
    fn signals_are_consumed_once() {
        let mut signals = ConfirmationSignals::default();
        signals.resolve("call-1", ConfirmationOutcome::Approved);

        assert_eq!(signals.take("call-1"), Some(ConfirmationOutcome::Approved));
        assert_eq!(signals.take("call-1"), None);
    }

    #[test]
    fn later_signal_for_same_invocation_wins() {
        let mut signals = ConfirmationSignals::default();
        signals.resolve("call-1", ConfirmationOutcome::Approved);
        signals.resolve("call-1", ConfirmationOutcome::Rejected);

        assert_eq!(signals.take("call-1"), Some(ConfirmationOutcome::Rejected));
    }

    #[test]
    fn pending_confirmations_follow_history_order() {
        let mut session = ChatSession::new(Some("Ada".to_string()));
        session.messages.push(Message::assistant_with_invocations(
            "",
            vec![ToolInvocation::requested(
                "call-1",
                "getWeatherInformation",
                Map::new(),
            )],
        ));
        session.messages.push(Message::assistant_with_invocations(
            "",
            vec![ToolInvocation::requested(
                "call-2",
                "getWeatherInformation",
                Map::new(),
            )],
        ));

        let pending = session.pending_confirmations();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "call-1");
        assert_eq!(pending[1].id, "call-2");
        assert!(session.has_pending_confirmations());
    }

    #[test]
    fn user_info_reports_unknown_without_a_name() {
        let session = ChatSession::new(None);
        assert_eq!(session.user_info_text(), "The user's name is unknown");

        let named = ChatSession::new(Some("Grace".to_string()));
        assert_eq!(named.user_info_text(), "The user's name is Grace");
    }

    #[test]
    fn router_isolates_users() {
        let mut router = SessionRouter::default();
        router.session_for("ada").push_user_message("hello");
        router.session_for("grace").push_user_message("hi");
        router
            .session_for("ada")
            .resolve("call-1", ConfirmationOutcome::Approved);

        assert_eq!(router.session_for("ada").messages.len(), 1);
        assert_eq!(router.session_for("grace").messages.len(), 1);
        assert!(router.session_for("grace").signals.is_empty());
        assert!(!router.session_for("ada").signals.is_empty());
    }
}

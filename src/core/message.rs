use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed text recorded for a rejected confirmation. Not an error: rejection
/// is a normal terminal state the model is expected to react to.
pub const DENIAL_TEXT: &str = "User denied tool execution.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TranscriptRole {
    User,
    Assistant,
    Tool,
}

impl TranscriptRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "assistant",
            TranscriptRole::Tool => "tool",
        }
    }

    pub fn is_user(self) -> bool {
        self == TranscriptRole::User
    }

    pub fn is_assistant(self) -> bool {
        self == TranscriptRole::Assistant
    }
}

impl AsRef<str> for TranscriptRole {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for TranscriptRole {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(TranscriptRole::User),
            "assistant" => Ok(TranscriptRole::Assistant),
            "tool" => Ok(TranscriptRole::Tool),
            _ => Err(format!("invalid transcript role: {value}")),
        }
    }
}

impl TryFrom<String> for TranscriptRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<TranscriptRole> for String {
    fn from(value: TranscriptRole) -> Self {
        value.as_str().to_string()
    }
}

/// State of one tool invocation inside the conversation.
///
/// `Requested` invocations of confirmation-gated tools survive across turns
/// until an approve/reject signal arrives; `Resolved` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InvocationState {
    Requested,
    Resolved { result: String },
}

impl InvocationState {
    pub fn is_requested(&self) -> bool {
        matches!(self, InvocationState::Requested)
    }

    pub fn result(&self) -> Option<&str> {
        match self {
            InvocationState::Resolved { result } => Some(result.as_str()),
            InvocationState::Requested => None,
        }
    }
}

/// One occurrence of a tool being called within the conversation.
///
/// The id is scoped to the conversation and comes from the model's tool-call
/// id. Arguments are captured exactly as requested so a later confirmed
/// execution runs with what the model originally asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub raw_arguments: String,
    #[serde(flatten)]
    pub state: InvocationState,
}

impl ToolInvocation {
    pub fn requested(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        let raw_arguments = Value::Object(arguments.clone()).to_string();
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
            raw_arguments,
            state: InvocationState::Requested,
        }
    }

    pub fn resolved(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
        result: impl Into<String>,
    ) -> Self {
        let mut invocation = Self::requested(id, tool_name, arguments);
        invocation.state = InvocationState::Resolved {
            result: result.into(),
        };
        invocation
    }

    /// Returns a copy of this invocation with a terminal result attached.
    pub fn with_result(&self, result: impl Into<String>) -> Self {
        let mut resolved = self.clone();
        resolved.state = InvocationState::Resolved {
            result: result.into(),
        };
        resolved
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_requested()
    }
}

/// One transcript entry. The conversation is append-only and is the source
/// of truth for which invocations are still pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: TranscriptRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: TranscriptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_invocations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::Assistant, content)
    }

    pub fn assistant_with_invocations(
        content: impl Into<String>,
        tool_invocations: Vec<ToolInvocation>,
    ) -> Self {
        let mut message = Self::assistant(content);
        message.tool_invocations = tool_invocations;
        message
    }

    pub fn is_user(&self) -> bool {
        self.role.is_user()
    }

    pub fn is_assistant(&self) -> bool {
        self.role.is_assistant()
    }

    pub fn pending_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.tool_invocations
            .iter()
            .filter(|invocation| invocation.is_pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(location: &str) -> Map<String, Value> {
        Map::from_iter([("location".to_string(), Value::from(location))])
    }

    #[test]
    fn invalid_role_strings_are_rejected() {
        assert!(TranscriptRole::try_from("system").is_err());
        assert_eq!(
            TranscriptRole::try_from("tool"),
            Ok(TranscriptRole::Tool)
        );
    }

    #[test]
    fn requested_invocation_is_pending() {
        let invocation = ToolInvocation::requested("call-1", "getWeatherInformation", args("Oslo"));
        assert!(invocation.is_pending());
        assert_eq!(invocation.raw_arguments, r#"{"location":"Oslo"}"#);
        assert_eq!(invocation.state.result(), None);
    }

    #[test]
    fn with_result_preserves_original_arguments() {
        let requested = ToolInvocation::requested("call-1", "getWeatherInformation", args("Oslo"));
        let resolved = requested.with_result("It is sunny in Oslo");

        assert!(!resolved.is_pending());
        assert_eq!(resolved.arguments, requested.arguments);
        assert_eq!(resolved.state.result(), Some("It is sunny in Oslo"));
    }

    #[test]
    fn pending_invocations_skips_resolved_entries() {
        let message = Message::assistant_with_invocations(
            "",
            vec![
                ToolInvocation::resolved("call-1", "getLocalTime", args("Oslo"), "10am"),
                ToolInvocation::requested("call-2", "getWeatherInformation", args("Oslo")),
            ],
        );

        let pending: Vec<_> = message.pending_invocations().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "call-2");
    }

    #[test]
    fn invocation_state_round_trips_through_serde() {
        let invocation =
            ToolInvocation::resolved("call-1", "tellAJoke", Map::new(), "outstanding in his field");
        let json = serde_json::to_value(&invocation).expect("serialize");
        assert_eq!(json["state"], "resolved");

        let back: ToolInvocation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.state.result(), Some("outstanding in his field"));
    }
}

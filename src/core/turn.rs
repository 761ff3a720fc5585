//! One request/response cycle of the conversation.
//!
//! A turn acquires a tool-server connection, rebuilds the tool registry from
//! the live tool list, resolves any outstanding confirmations, then streams
//! model output, executing auto tools inline and stalling on the first
//! confirmation-gated call. The connection is released on every exit path.

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatToolCall, ChatToolCallFunction, ChatToolDefinition};
use crate::core::chat_stream::{
    ChatStreamService, PendingToolCall, StreamMessage, StreamParams, ToolCallAccumulator,
};
use crate::core::config::Config;
use crate::core::message::{Message, ToolInvocation, TranscriptRole};
use crate::core::session::{user_info_parameters, ChatSession, GET_USER_INFO_TOOL};
use crate::mcp::client::{ToolServerClient, ToolServerConnection};
use crate::mcp::executor::GatedExecutor;
use crate::mcp::registry::{ConfirmationList, ToolRegistry};
use crate::mcp::resolver::resolve_pending;

/// Events merged into one ordered outgoing stream: incremental model text
/// interleaved with finalized tool results.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    TextDelta(String),
    ToolResult {
        invocation_id: String,
        tool_name: String,
        result: String,
    },
    ConfirmationRequired {
        invocation_id: String,
        tool_name: String,
        arguments: Map<String, Value>,
    },
    Error(String),
    End,
}

pub struct TurnDriver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    max_steps: u32,
    confirmations: ConfirmationList,
    tool_client: ToolServerClient,
}

impl TurnDriver {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let api_key = config.provider.api_key()?;
        let tool_client = ToolServerClient::new(config.tool_server.clone())?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.provider.base_url.clone(),
            api_key,
            model: config.provider.model.clone(),
            system_prompt: config.effective_system_prompt().to_string(),
            max_steps: config.effective_max_steps(),
            confirmations: ConfirmationList::new(config.tools_requiring_confirmation.clone()),
            tool_client,
        })
    }

    /// Drives one turn to completion. Always terminates the event stream
    /// with [`TurnEvent::End`], and always releases the tool-server
    /// connection on success, error, and cancellation alike.
    pub async fn drive_turn(
        &self,
        session: &mut ChatSession,
        events: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancellationToken,
    ) {
        let events = &events;
        let mut connection = match self.tool_client.connect().await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(error = %err, "Tool server connection failed, aborting turn");
                let _ = events.send(TurnEvent::Error(format!(
                    "Could not reach the tool server: {err}"
                )));
                let _ = events.send(TurnEvent::End);
                return;
            }
        };

        let outcome = self
            .run_turn(session, &mut connection, events, &cancel)
            .await;

        if let Err(err) = connection.close().await {
            debug!(error = %err, "Tool server session close failed");
        }

        if let Err(err) = outcome {
            warn!(error = %err, "Turn ended with error");
            let _ = events.send(TurnEvent::Error(err));
        }
        let _ = events.send(TurnEvent::End);
    }

    async fn run_turn(
        &self,
        session: &mut ChatSession,
        connection: &mut ToolServerConnection,
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let tools = connection.list_tools().await?;
        let registry = ToolRegistry::build(&tools, &self.confirmations);
        debug!(
            auto = registry.auto_tools().count(),
            confirm = registry.confirm_tools().count(),
            "Tool registry built"
        );

        let (patched, resolutions) = {
            let mut executor = GatedExecutor::new(&registry, connection);
            resolve_pending(&session.messages, &mut session.signals, &mut executor).await
        };
        session.messages = patched;
        for resolution in resolutions {
            let _ = events.send(TurnEvent::ToolResult {
                invocation_id: resolution.invocation_id,
                tool_name: resolution.tool_name,
                result: resolution.result,
            });
        }

        // A confirmation that is still unanswered blocks the model: the
        // history cannot be replayed with an open tool call, so the pending
        // affordance is re-presented instead.
        if session.has_pending_confirmations() {
            for invocation in session.pending_confirmations() {
                let _ = events.send(TurnEvent::ConfirmationRequired {
                    invocation_id: invocation.id.clone(),
                    tool_name: invocation.tool_name.clone(),
                    arguments: invocation.arguments.clone(),
                });
            }
            return Ok(());
        }

        for step in 0..self.max_steps {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let (text, calls) = self
                .stream_model_step(&registry, session, events, cancel, u64::from(step))
                .await?;

            if cancel.is_cancelled() {
                if !text.is_empty() {
                    session.messages.push(Message::assistant(text));
                }
                return Ok(());
            }

            if calls.is_empty() {
                if !text.is_empty() {
                    session.messages.push(Message::assistant(text));
                }
                return Ok(());
            }

            let mut invocations = Vec::with_capacity(calls.len());
            let mut awaiting_confirmation = false;

            for (index, call) in calls {
                let invocation = self
                    .dispatch_tool_call(index, call, &registry, session, connection, events, cancel)
                    .await;
                if invocation.is_pending() {
                    awaiting_confirmation = true;
                }
                invocations.push(invocation);
            }

            session
                .messages
                .push(Message::assistant_with_invocations(text, invocations));

            if awaiting_confirmation || cancel.is_cancelled() {
                return Ok(());
            }
        }

        warn!(max_steps = self.max_steps, "Turn hit the step limit");
        Ok(())
    }

    /// Classifies one completed tool call and produces its invocation
    /// record: local tools answer from session state, auto tools execute
    /// over the connection, confirmation tools are left `Requested`.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_call(
        &self,
        index: u32,
        call: PendingToolCall,
        registry: &ToolRegistry,
        session: &ChatSession,
        connection: &mut ToolServerConnection,
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> ToolInvocation {
        let invocation_id = call
            .id
            .unwrap_or_else(|| format!("tool-call-{index}"));
        let tool_name = call.name.unwrap_or_else(|| "unknown".to_string());

        let arguments = match parse_call_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(err) => {
                let result = format!("Error: invalid tool arguments: {err}");
                let _ = events.send(TurnEvent::ToolResult {
                    invocation_id: invocation_id.clone(),
                    tool_name: tool_name.clone(),
                    result: result.clone(),
                });
                return ToolInvocation::resolved(invocation_id, tool_name, Map::new(), result);
            }
        };

        if tool_name == GET_USER_INFO_TOOL {
            let result = session.user_info_text();
            let _ = events.send(TurnEvent::ToolResult {
                invocation_id: invocation_id.clone(),
                tool_name: tool_name.clone(),
                result: result.clone(),
            });
            return ToolInvocation::resolved(invocation_id, tool_name, arguments, result);
        }

        if registry.requires_confirmation(&tool_name) {
            debug!(
                invocation_id = %invocation_id,
                tool_name = %tool_name,
                "Tool call awaits user confirmation"
            );
            let invocation = ToolInvocation::requested(invocation_id, tool_name, arguments);
            let _ = events.send(TurnEvent::ConfirmationRequired {
                invocation_id: invocation.id.clone(),
                tool_name: invocation.tool_name.clone(),
                arguments: invocation.arguments.clone(),
            });
            return invocation;
        }

        if cancel.is_cancelled() {
            let result = "Error: turn cancelled before execution.".to_string();
            return ToolInvocation::resolved(invocation_id, tool_name, arguments, result);
        }

        let invocation = ToolInvocation::requested(invocation_id, tool_name, arguments);
        let result = GatedExecutor::new(registry, connection)
            .execute_auto(&invocation)
            .await;
        let _ = events.send(TurnEvent::ToolResult {
            invocation_id: invocation.id.clone(),
            tool_name: invocation.tool_name.clone(),
            result: result.clone(),
        });
        invocation.with_result(result)
    }

    /// Streams one model call, forwarding text deltas as they arrive and
    /// reassembling tool-call fragments.
    async fn stream_model_step(
        &self,
        registry: &ToolRegistry,
        session: &ChatSession,
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
        stream_id: u64,
    ) -> Result<(String, Vec<(u32, PendingToolCall)>), String> {
        let mut tools = registry.chat_definitions();
        tools.push(ChatToolDefinition::function(
            GET_USER_INFO_TOOL,
            Some("Get the user's name".to_string()),
            user_info_parameters(),
        ));

        let (service, mut rx) = ChatStreamService::new();
        service.spawn_stream(StreamParams {
            client: self.http.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            api_messages: api_messages_from_history(&self.system_prompt, &session.messages),
            tools: Some(tools),
            cancel_token: cancel.clone(),
            stream_id,
        });
        // Drop our sender so the receiver drains once the stream task exits,
        // including the cancellation path that never sends End.
        drop(service);

        let mut text = String::new();
        let mut accumulator = ToolCallAccumulator::default();
        let mut stream_error: Option<String> = None;

        while let Some((message, _)) = rx.recv().await {
            match message {
                StreamMessage::Chunk(chunk) => {
                    text.push_str(&chunk);
                    let _ = events.send(TurnEvent::TextDelta(chunk));
                }
                StreamMessage::ToolCall(delta) => accumulator.push(delta),
                StreamMessage::Error(error) => stream_error = Some(error),
                StreamMessage::End => break,
            }
        }

        if let Some(error) = stream_error {
            return Err(error);
        }
        Ok((text, accumulator.finish()))
    }
}

fn parse_call_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(err) => Err(err.to_string()),
    }
}

/// Renders the transcript for the model API: the system prompt first, then
/// each entry, with resolved invocations expanded into the assistant
/// tool-call record plus one tool message per result.
fn api_messages_from_history(system_prompt: &str, messages: &[Message]) -> Vec<ChatMessage> {
    let mut api_messages = vec![ChatMessage::text("system", system_prompt)];

    for message in messages {
        match message.role {
            TranscriptRole::User => {
                api_messages.push(ChatMessage::text("user", message.content.clone()));
            }
            TranscriptRole::Assistant => {
                let tool_calls: Vec<ChatToolCall> = message
                    .tool_invocations
                    .iter()
                    .map(|invocation| ChatToolCall {
                        id: invocation.id.clone(),
                        kind: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: invocation.tool_name.clone(),
                            arguments: invocation.raw_arguments.clone(),
                        },
                    })
                    .collect();

                api_messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: message.content.clone(),
                    tool_call_id: None,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                });

                for invocation in &message.tool_invocations {
                    if let Some(result) = invocation.state.result() {
                        api_messages.push(ChatMessage {
                            role: "tool".to_string(),
                            content: result.to_string(),
                            tool_call_id: Some(invocation.id.clone()),
                            tool_calls: None,
                        });
                    }
                }
            }
            TranscriptRole::Tool => {
                for invocation in &message.tool_invocations {
                    if let Some(result) = invocation.state.result() {
                        api_messages.push(ChatMessage {
                            role: "tool".to_string(),
                            content: result.to_string(),
                            tool_call_id: Some(invocation.id.clone()),
                            tool_calls: None,
                        });
                    }
                }
            }
        }
    }

    api_messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use serde_json::json;

    #[test]
    fn empty_arguments_parse_to_empty_object() {
        assert!(parse_call_arguments("").expect("parse").is_empty());
        assert!(parse_call_arguments("  ").expect("parse").is_empty());
    }

    #[test]
    fn object_arguments_parse() {
        let arguments = parse_call_arguments(r#"{"location":"Oslo"}"#).expect("parse");
        assert_eq!(arguments.get("location"), Some(&json!("Oslo")));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        assert!(parse_call_arguments("[1,2]").is_err());
        assert!(parse_call_arguments("{not json").is_err());
    }

    #[test]
    fn history_rendering_starts_with_system_prompt() {
        let api_messages = api_messages_from_history("be helpful", &[Message::user("hi")]);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[0].content, "be helpful");
        assert_eq!(api_messages[1].role, "user");
    }

    #[test]
    fn resolved_invocations_expand_to_tool_messages() {
        let arguments =
            Map::from_iter([("location".to_string(), json!("Oslo"))]);
        let history = vec![
            Message::user("What's the weather in Oslo?"),
            Message::assistant_with_invocations(
                "",
                vec![ToolInvocation::resolved(
                    "call-1",
                    "getWeatherInformation",
                    arguments,
                    "It is sunny in Oslo",
                )],
            ),
            Message::assistant("Sunny skies in Oslo today."),
        ];

        let api_messages = api_messages_from_history("prompt", &history);
        assert_eq!(api_messages.len(), 5);

        let assistant = &api_messages[2];
        assert_eq!(assistant.role, "assistant");
        let calls = assistant.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].id, "call-1");
        assert_eq!(calls[0].function.arguments, r#"{"location":"Oslo"}"#);

        let tool = &api_messages[3];
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(tool.content, "It is sunny in Oslo");

        assert_eq!(api_messages[4].role, "assistant");
        assert!(api_messages[4].tool_calls.is_none());
    }

    #[test]
    fn assistant_without_invocations_has_no_tool_calls_field() {
        let api_messages =
            api_messages_from_history("prompt", &[Message::assistant("hello")]);
        assert!(api_messages[1].tool_calls.is_none());
    }
}

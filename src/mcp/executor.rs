//! Confirmation-gated tool execution.
//!
//! Auto tools run inline while the model is generating; confirmation tools
//! run only after the resolver has seen an approval. Both paths share one
//! contract: validate arguments, perform the remote call, flatten the
//! response to text. Per-tool failures degrade to a textual result so the
//! model can react in its next step; they never abort the turn.

use rust_mcp_schema::{CallToolResult, ContentBlock};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::message::ToolInvocation;
use crate::mcp::client::ToolConnection;
use crate::mcp::registry::{ToolDescriptor, ToolRegistry};

pub struct GatedExecutor<'a> {
    registry: &'a ToolRegistry,
    connection: &'a mut dyn ToolConnection,
}

impl<'a> GatedExecutor<'a> {
    pub fn new(registry: &'a ToolRegistry, connection: &'a mut dyn ToolConnection) -> Self {
        Self {
            registry,
            connection,
        }
    }

    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.registry.requires_confirmation(tool_name)
    }

    /// Runs an auto tool immediately. The returned string is always a
    /// terminal textual result, success or failure.
    pub async fn execute_auto(&mut self, invocation: &ToolInvocation) -> String {
        match self.registry.auto_tool(&invocation.tool_name) {
            Some(descriptor) => self.run(descriptor, invocation).await,
            None => format!("Error: unknown tool: {}", invocation.tool_name),
        }
    }

    /// Runs a confirmation tool after an approval signal. Same remote-call
    /// and flattening contract as the auto path.
    pub async fn execute_confirmed(&mut self, invocation: &ToolInvocation) -> String {
        match self.registry.confirm_tool(&invocation.tool_name) {
            Some(descriptor) => self.run(descriptor, invocation).await,
            None => format!("Error: unknown tool: {}", invocation.tool_name),
        }
    }

    async fn run(&mut self, descriptor: &ToolDescriptor, invocation: &ToolInvocation) -> String {
        if let Err(mismatch) = descriptor.schema.validate(&invocation.arguments) {
            return format!("Error: {mismatch}");
        }

        debug!(
            tool_name = %invocation.tool_name,
            invocation_id = %invocation.id,
            "Executing tool call"
        );
        match self
            .connection
            .call_tool(&invocation.tool_name, invocation.arguments.clone())
            .await
        {
            Ok(result) => flatten_call_result(&result),
            Err(err) => format!("Error: {err}"),
        }
    }
}

/// Concatenates the textual content segments of a tool response with single
/// spaces. Responses without any text segment are stringified as a fallback.
pub fn flatten_call_result(result: &CallToolResult) -> String {
    let segments: Vec<&str> = result
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::TextContent(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect();

    if segments.is_empty() {
        serde_json::to_string_pretty(result)
            .unwrap_or_else(|_| "Unable to render tool response.".to_string())
    } else {
        segments.join(" ")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    /// In-process stand-in for the remote tool server, recording every call.
    pub struct FakeConnection {
        pub calls: Vec<(String, Map<String, Value>)>,
        pub response: Result<Value, String>,
    }

    impl FakeConnection {
        pub fn replying_text(text: &str) -> Self {
            Self {
                calls: Vec::new(),
                response: Ok(json!({
                    "content": [{"type": "text", "text": text}]
                })),
            }
        }

        pub fn failing(error: &str) -> Self {
            Self {
                calls: Vec::new(),
                response: Err(error.to_string()),
            }
        }

        pub fn replying_raw(content: Value) -> Self {
            Self {
                calls: Vec::new(),
                response: Ok(content),
            }
        }
    }

    #[async_trait]
    impl ToolConnection for FakeConnection {
        async fn call_tool(
            &mut self,
            name: &str,
            arguments: Map<String, Value>,
        ) -> Result<CallToolResult, String> {
            self.calls.push((name.to_string(), arguments));
            self.response.clone().map(|value| {
                serde_json::from_value(value).expect("fake response should deserialize")
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeConnection;
    use super::*;
    use crate::mcp::registry::ConfirmationList;
    use rust_mcp_schema::Tool;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        serde_json::from_value(json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {
                "type": "object",
                "properties": {"location": {"type": "string"}},
            },
        }))
        .expect("tool should deserialize")
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::build(
            &[tool("getLocalTime"), tool("getWeatherInformation")],
            &ConfirmationList::new(vec!["getWeatherInformation".to_string()]),
        )
    }

    fn invocation(tool_name: &str, location: &str) -> ToolInvocation {
        ToolInvocation::requested(
            "call-1",
            tool_name,
            Map::from_iter([("location".to_string(), json!(location))]),
        )
    }

    #[tokio::test]
    async fn auto_execution_forwards_original_arguments() {
        let registry = registry();
        let mut connection = FakeConnection::replying_text("It is 10am in Oslo");
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_auto(&invocation("getLocalTime", "Oslo"))
            .await;

        assert_eq!(result, "It is 10am in Oslo");
        assert_eq!(connection.calls.len(), 1);
        let (name, arguments) = &connection.calls[0];
        assert_eq!(name, "getLocalTime");
        assert_eq!(arguments.get("location"), Some(&json!("Oslo")));
    }

    #[tokio::test]
    async fn text_segments_join_with_single_spaces() {
        let registry = registry();
        let mut connection = FakeConnection::replying_raw(json!({
            "content": [
                {"type": "text", "text": "Why did the scarecrow win an award?"},
                {"type": "text", "text": "Because he was outstanding in his field!"}
            ]
        }));
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_auto(&invocation("getLocalTime", "Oslo"))
            .await;

        assert_eq!(
            result,
            "Why did the scarecrow win an award? Because he was outstanding in his field!"
        );
    }

    #[tokio::test]
    async fn non_text_responses_are_stringified() {
        let registry = registry();
        let mut connection = FakeConnection::replying_raw(json!({"content": []}));
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_auto(&invocation("getLocalTime", "Oslo"))
            .await;

        assert!(result.contains("content"), "fallback should render the payload: {result}");
    }

    #[tokio::test]
    async fn remote_failure_becomes_textual_result() {
        let registry = registry();
        let mut connection = FakeConnection::failing("connection reset");
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_auto(&invocation("getLocalTime", "Oslo"))
            .await;

        assert_eq!(result, "Error: connection reset");
    }

    #[tokio::test]
    async fn schema_mismatch_skips_the_remote_call() {
        let registry = registry();
        let mut connection = FakeConnection::replying_text("unused");
        let bad = ToolInvocation::requested(
            "call-1",
            "getLocalTime",
            Map::from_iter([("location".to_string(), json!(5))]),
        );
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_auto(&bad)
            .await;

        assert_eq!(result, "Error: argument 'location' is not a string");
        assert!(connection.calls.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_without_a_call() {
        let registry = registry();
        let mut connection = FakeConnection::replying_text("unused");
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_auto(&invocation("selfDestruct", "Oslo"))
            .await;

        assert_eq!(result, "Error: unknown tool: selfDestruct");
        assert!(connection.calls.is_empty());
    }

    #[tokio::test]
    async fn confirmed_execution_uses_the_confirm_descriptor() {
        let registry = registry();
        let mut connection = FakeConnection::replying_text("It is sunny in Oslo");
        let result = GatedExecutor::new(&registry, &mut connection)
            .execute_confirmed(&invocation("getWeatherInformation", "Oslo"))
            .await;

        assert_eq!(result, "It is sunny in Oslo");
        assert_eq!(connection.calls.len(), 1);
    }
}

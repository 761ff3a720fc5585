use std::collections::HashMap;

use rust_mcp_schema::Tool;
use serde_json::Value;

use crate::api::ChatToolDefinition;
use crate::mcp::schema::ParamSchema;

/// The set of tool names requiring explicit user approval before execution.
///
/// Configured once at startup and injected here as an immutable value;
/// membership is the sole gate between auto-execute and confirm-first.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationList {
    names: Vec<String>,
}

impl ConfirmationList {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.names.iter().any(|name| name == tool_name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One registered tool: description and parameter validator, rebuilt on
/// every turn from the server's advertised list.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub schema: ParamSchema,
}

impl ToolDescriptor {
    fn from_advertised(tool: &Tool) -> Self {
        let input_schema =
            serde_json::to_value(&tool.input_schema).unwrap_or(Value::Null);
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            schema: ParamSchema::translate(&input_schema),
        }
    }

    pub fn to_chat_definition(&self) -> ChatToolDefinition {
        ChatToolDefinition::function(
            self.name.clone(),
            self.description.clone(),
            self.schema.to_json_schema(),
        )
    }
}

/// Tools advertised by the remote server, partitioned by confirmation
/// requirement. Auto tools execute inline during generation; confirm tools
/// are declared to the model with description and schema only and stall
/// until a user decision arrives.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    auto_tools: HashMap<String, ToolDescriptor>,
    confirm_tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Partitions the advertised tool list. Every advertised name lands in
    /// exactly one set; duplicate names overwrite earlier entries.
    pub fn build(tools: &[Tool], confirmations: &ConfirmationList) -> Self {
        let mut registry = Self::default();
        for tool in tools {
            let descriptor = ToolDescriptor::from_advertised(tool);
            if confirmations.contains(&tool.name) {
                registry.confirm_tools.insert(tool.name.clone(), descriptor);
            } else {
                registry.auto_tools.insert(tool.name.clone(), descriptor);
            }
        }
        registry
    }

    pub fn auto_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.auto_tools.get(name)
    }

    pub fn confirm_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.confirm_tools.get(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.auto_tools
            .get(name)
            .or_else(|| self.confirm_tools.get(name))
    }

    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.confirm_tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.auto_tools.is_empty() && self.confirm_tools.is_empty()
    }

    pub fn auto_tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.auto_tools.values()
    }

    pub fn confirm_tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.confirm_tools.values()
    }

    /// Renders every registered tool for the model request. Confirmation
    /// tools are indistinguishable from auto tools on the wire; the gate is
    /// applied when the model asks for one, not in the declaration.
    pub fn chat_definitions(&self) -> Vec<ChatToolDefinition> {
        let mut definitions: Vec<ChatToolDefinition> = self
            .auto_tools
            .values()
            .chain(self.confirm_tools.values())
            .map(ToolDescriptor::to_chat_definition)
            .collect();
        definitions.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        definitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tool(name: &str, properties: Value) -> Tool {
        serde_json::from_value(json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {
                "type": "object",
                "properties": properties,
            },
        }))
        .expect("tool should deserialize")
    }

    fn weather_confirmations() -> ConfirmationList {
        ConfirmationList::new(vec!["getWeatherInformation".to_string()])
    }

    #[test]
    fn listed_tools_land_in_confirm_set() {
        let tools = vec![
            sample_tool("getWeatherInformation", json!({"location": {"type": "string"}})),
            sample_tool("getLocalTime", json!({"location": {"type": "string"}})),
        ];
        let registry = ToolRegistry::build(&tools, &weather_confirmations());

        assert!(registry.confirm_tool("getWeatherInformation").is_some());
        assert!(registry.auto_tool("getWeatherInformation").is_none());
        assert!(registry.auto_tool("getLocalTime").is_some());
        assert!(registry.confirm_tool("getLocalTime").is_none());
        assert!(registry.requires_confirmation("getWeatherInformation"));
        assert!(!registry.requires_confirmation("getLocalTime"));
    }

    #[test]
    fn confirmation_listed_schema_still_validates() {
        let tools = vec![sample_tool(
            "getWeatherInformation",
            json!({"location": {"type": "string"}}),
        )];
        let registry = ToolRegistry::build(&tools, &weather_confirmations());
        let descriptor = registry
            .confirm_tool("getWeatherInformation")
            .expect("descriptor");

        let valid =
            serde_json::Map::from_iter([("location".to_string(), json!("Paris"))]);
        assert!(descriptor.schema.validate(&valid).is_ok());

        let invalid = serde_json::Map::from_iter([("location".to_string(), json!(5))]);
        assert!(descriptor.schema.validate(&invalid).is_err());
    }

    #[test]
    fn duplicate_names_last_wins() {
        let tools = vec![
            sample_tool("lookup", json!({"a": {"type": "string"}})),
            sample_tool("lookup", json!({"b": {"type": "number"}})),
        ];
        let registry = ToolRegistry::build(&tools, &ConfirmationList::default());

        let descriptor = registry.auto_tool("lookup").expect("descriptor");
        assert!(descriptor.schema.kind_of("b").is_some());
        assert!(descriptor.schema.kind_of("a").is_none());
    }

    #[test]
    fn every_advertised_name_appears_in_exactly_one_set() {
        let tools = vec![
            sample_tool("getWeatherInformation", json!({})),
            sample_tool("tellAJoke", json!({})),
            sample_tool("getFactAboutTopic", json!({"topic": {"type": "string"}})),
        ];
        let registry = ToolRegistry::build(&tools, &weather_confirmations());

        for tool in &tools {
            let in_auto = registry.auto_tool(&tool.name).is_some();
            let in_confirm = registry.confirm_tool(&tool.name).is_some();
            assert!(in_auto ^ in_confirm, "{} must be in exactly one set", tool.name);
        }
    }

    #[test]
    fn chat_definitions_cover_both_sets() {
        let tools = vec![
            sample_tool("getWeatherInformation", json!({"location": {"type": "string"}})),
            sample_tool("getLocalTime", json!({"location": {"type": "string"}})),
        ];
        let registry = ToolRegistry::build(&tools, &weather_confirmations());
        let definitions = registry.chat_definitions();

        let names: Vec<&str> = definitions
            .iter()
            .map(|def| def.function.name.as_str())
            .collect();
        assert_eq!(names, vec!["getLocalTime", "getWeatherInformation"]);
    }
}

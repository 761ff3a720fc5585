use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that uses the responses from tools to answer the user's query.";

const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TOOL_SERVER_URL: &str = "http://localhost:5173/mcp";

/// Bound on model-call steps within one turn, so a tool-call chain cannot
/// loop forever.
const DEFAULT_MAX_STEPS: u32 = 100;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
        }
    }
}

impl ProviderConfig {
    pub fn api_key(&self) -> Result<String, String> {
        std::env::var(&self.api_key_env)
            .map_err(|_| format!("Environment variable {} is not set", self.api_key_env))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ToolServerConfig {
    #[serde(default = "default_tool_server_url")]
    pub base_url: String,
    pub protocol_version: Option<String>,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_tool_server_url(),
            protocol_version: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub tool_server: ToolServerConfig,
    /// Tool names requiring explicit user approval before execution.
    #[serde(default)]
    pub tools_requiring_confirmation: Vec<String>,
    pub max_steps: Option<u32>,
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn load() -> Result<Config, Box<dyn std::error::Error>> {
        let config_path = Self::get_config_path();
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(config_path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(proj_dirs) = ProjectDirs::from("org", "palaver", "palaver") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            PathBuf::from("palaver.toml")
        }
    }

    pub fn effective_max_steps(&self) -> u32 {
        self.max_steps.unwrap_or(DEFAULT_MAX_STEPS).max(1)
    }

    pub fn effective_system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

fn default_provider_base_url() -> String {
    DEFAULT_PROVIDER_BASE_URL.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_tool_server_url() -> String {
    DEFAULT_TOOL_SERVER_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let config = Config::load_from_path(&path).expect("load");

        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
        assert!(config.tools_requiring_confirmation.is_empty());
        assert_eq!(config.effective_max_steps(), 100);
        assert_eq!(config.effective_system_prompt(), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
tools_requiring_confirmation = ["getWeatherInformation"]
max_steps = 5

[tool_server]
base_url = "https://tools.example.com/mcp"
"#,
        )
        .expect("write");

        let config = Config::load_from_path(&path).expect("load");
        assert_eq!(
            config.tools_requiring_confirmation,
            vec!["getWeatherInformation".to_string()]
        );
        assert_eq!(config.effective_max_steps(), 5);
        assert_eq!(config.tool_server.base_url, "https://tools.example.com/mcp");
        assert_eq!(config.provider.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn zero_max_steps_is_clamped() {
        let config = Config {
            max_steps: Some(0),
            ..Config::default()
        };
        assert_eq!(config.effective_max_steps(), 1);
    }
}

//! Streamable HTTP client for the remote tool server.
//!
//! A connection is scoped to a single conversation turn: the driver
//! connects, lists tools, executes calls, and closes the session on every
//! exit path. Nothing here is cached across turns.

use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeRequestParams, InitializeResult, ListToolsResult, PaginatedRequestParams, RequestId,
    RpcError, Tool, LATEST_PROTOCOL_VERSION,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::config::ToolServerConfig;
use crate::mcp::sse::{is_event_stream_content_type, next_sse_server_message};

/// Upper bound on the registered tool list so a misbehaving server cannot
/// grow the registry without bound.
pub const MAX_TOOL_LIST: usize = 100;

const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const HTTP_REQUEST_TIMEOUT_SECONDS: u64 = 60;
const HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Remote calls available to the executor and resolver. The production
/// implementation is [`ToolServerConnection`]; tests substitute in-process
/// fakes.
#[async_trait]
pub trait ToolConnection: Send {
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, String>;
}

pub struct ToolServerClient {
    config: ToolServerConfig,
    http: reqwest::Client,
}

impl ToolServerClient {
    pub fn new(config: ToolServerConfig) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECONDS))
            .pool_idle_timeout(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {err}"))?;
        Ok(Self { config, http })
    }

    /// Performs the initialize handshake and returns a live connection.
    /// Failure here is fatal to the turn: no tool set can be determined.
    pub async fn connect(&self) -> Result<ToolServerConnection, String> {
        let mut connection = ToolServerConnection {
            config: self.config.clone(),
            http: self.http.clone(),
            session_id: None,
            negotiated_protocol_version: None,
            request_id: 0,
            closed: false,
        };
        connection.initialize().await?;
        debug!(
            connection_id = connection.connection_id().unwrap_or("<none>"),
            "Tool server connected"
        );
        Ok(connection)
    }
}

/// One live connection to the tool server, identified by the session id the
/// server assigned during initialize.
pub struct ToolServerConnection {
    config: ToolServerConfig,
    http: reqwest::Client,
    session_id: Option<String>,
    negotiated_protocol_version: Option<String>,
    request_id: u64,
    closed: bool,
}

impl ToolServerConnection {
    pub fn connection_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn next_request_id(&mut self) -> i64 {
        let request_id = self.request_id as i64;
        self.request_id = self.request_id.saturating_add(1);
        request_id
    }

    fn effective_protocol_version(&self) -> String {
        match self.negotiated_protocol_version.as_deref() {
            Some(version) if !version.trim().is_empty() => version.to_string(),
            _ => requested_protocol_version(&self.config),
        }
    }

    async fn initialize(&mut self) -> Result<(), String> {
        let request = RequestFromClient::InitializeRequest(client_details_for(&self.config));
        let response = self.send_request(request).await?;
        let initialize = parse_initialize_result(response)?;
        self.negotiated_protocol_version = Some(initialize.protocol_version);

        if self.session_id.is_none() {
            return Err("Missing session id on initialize response.".to_string());
        }

        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await
    }

    /// Fetches the advertised tool list, following pagination cursors up to
    /// [`MAX_TOOL_LIST`] entries.
    pub async fn list_tools(&mut self) -> Result<Vec<Tool>, String> {
        let mut tools: Vec<Tool> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                cursor: Some(cursor),
                meta: None,
            });
            let response = self
                .send_request(RequestFromClient::ListToolsRequest(params))
                .await?;
            let list: ListToolsResult = parse_list_tools(response)?;
            tools.extend(list.tools);

            if tools.len() >= MAX_TOOL_LIST {
                tools.truncate(MAX_TOOL_LIST);
                break;
            }
            match list.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(count = tools.len(), "Tool listing fetched");
        Ok(tools)
    }

    /// Releases the connection. Safe to call more than once; servers that do
    /// not support explicit termination (405) are treated as closed.
    pub async fn close(&mut self) -> Result<(), String> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        debug!(connection_id = %session_id, "Closing tool server connection");
        let response = self
            .http
            .delete(&self.config.base_url)
            .header(SESSION_ID_HEADER, session_id)
            .header(
                PROTOCOL_VERSION_HEADER,
                self.effective_protocol_version(),
            )
            .send()
            .await
            .map_err(|err| err.to_string())?;

        if response.status().is_success()
            || response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
        {
            Ok(())
        } else {
            Err(format!("HTTP error on session close: {}", response.status()))
        }
    }

    async fn send_notification(
        &mut self,
        notification: NotificationFromClient,
    ) -> Result<(), String> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| err.to_string())?;
        let response = self.post_message(&message).await?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        self.capture_session_id(&response);
        Ok(())
    }

    async fn send_request(&mut self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(request_id)),
        )
        .map_err(|err| err.to_string())?;

        let response = self.post_message(&message).await?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        self.capture_session_id(&response);

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if is_event_stream_content_type(&content_type) {
            next_sse_server_message(response).await
        } else {
            let body = response.bytes().await.map_err(|err| err.to_string())?;
            serde_json::from_slice::<ServerMessage>(&body).map_err(|err| err.to_string())
        }
    }

    async fn post_message(&self, message: &ClientMessage) -> Result<reqwest::Response, String> {
        let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
        debug!(url = %self.config.base_url, "Sending tool server request");
        let mut request = self
            .http
            .post(&self.config.base_url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT)
            .header(PROTOCOL_VERSION_HEADER, self.effective_protocol_version())
            .body(payload);

        if let Some(session_id) = self.session_id.as_ref() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }

        request.send().await.map_err(|err| err.to_string())
    }

    fn capture_session_id(&mut self, response: &reqwest::Response) {
        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }
    }
}

#[async_trait]
impl ToolConnection for ToolServerConnection {
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, String> {
        let mut params = CallToolRequestParams::new(name);
        if !arguments.is_empty() {
            params = params.with_arguments(arguments);
        }
        let response = self
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        parse_call_tool(response)
    }
}

fn requested_protocol_version(config: &ToolServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

fn client_details_for(config: &ToolServerConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "palaver".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Palaver chat agent".to_string()),
            description: Some("Palaver tool-server client".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(config),
    }
}

fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let value = parse_response_value(message)?;
    let result =
        serde_json::from_value::<InitializeResult>(value).map_err(|err| err.to_string())?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<ListToolsResult>(value).map_err(|err| err.to_string())
}

fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<CallToolResult>(value).map_err(|err| err.to_string())
}

fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        _ => Err("Unexpected message from tool server.".to_string()),
    }
}

fn format_rpc_error(error: &RpcError) -> String {
    format!("Tool server error {}: {}", error.code, error.message)
}

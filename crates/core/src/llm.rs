//! Language-model collaborator: message types, the [`LanguageModel`] trait and
//! a Messages-API client with server-sent-event streaming.

use crate::config::ModelConfig;
use crate::embeddings::ensure_trailing_slash;
use crate::error::ModelError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default)]
pub struct MessageRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl MessageResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

pub type TextSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: &MessageRequest) -> Result<MessageResponse, ModelError>;

    /// Streams text deltas into `on_text` as they are generated and returns
    /// the assembled response. Models without native streaming emit their
    /// whole text once.
    async fn stream(
        &self,
        request: &MessageRequest,
        on_text: TextSink<'_>,
    ) -> Result<MessageResponse, ModelError> {
        let response = self.complete(request).await?;
        let text = response.text();
        if !text.is_empty() {
            on_text(&text);
        }
        Ok(response)
    }
}

pub struct AnthropicClient {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl AnthropicClient {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ModelError::Config("ANTHROPIC_API_KEY is not set".to_string()))?;
        let endpoint = Url::parse(&ensure_trailing_slash(&config.base_url))?.join("messages")?;

        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key,
            model: config.model.clone(),
            timeout: config.timeout,
        })
    }

    fn body(&self, request: &MessageRequest, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(self.model));
        body.insert("max_tokens".to_string(), json!(request.max_tokens));
        body.insert("messages".to_string(), json!(request.messages));
        if let Some(system) = &request.system {
            body.insert("system".to_string(), json!(system));
        }
        if !request.tools.is_empty() {
            body.insert("tools".to_string(), json!(request.tools));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if stream {
            body.insert("stream".to_string(), json!(true));
        }
        Value::Object(body)
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| map_transport_error(error, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<StopReason>,
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete(&self, request: &MessageRequest) -> Result<MessageResponse, ModelError> {
        let response = self.send(&self.body(request, false)).await?;
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|error| ModelError::Decode(error.to_string()))?;

        Ok(MessageResponse {
            content: wire
                .content
                .into_iter()
                .filter_map(|block| serde_json::from_value(block).ok())
                .collect(),
            stop_reason: wire.stop_reason.unwrap_or_default(),
        })
    }

    async fn stream(
        &self,
        request: &MessageRequest,
        on_text: TextSink<'_>,
    ) -> Result<MessageResponse, ModelError> {
        let response = self.send(&self.body(request, true)).await?;
        let mut bytes = response.bytes_stream();
        let mut assembler = StreamAssembler::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|error| map_transport_error(error, self.timeout))?;
            assembler.push(&chunk, on_text)?;
        }

        assembler.finish()
    }
}

fn map_transport_error(error: reqwest::Error, timeout: Duration) -> ModelError {
    if error.is_timeout() {
        ModelError::Timeout(timeout)
    } else {
        ModelError::Http(error)
    }
}

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Incrementally decodes a Messages-API event stream.
#[derive(Debug, Default)]
pub(crate) struct StreamAssembler {
    buffer: Vec<u8>,
    blocks: BTreeMap<usize, PartialBlock>,
    stop_reason: Option<StopReason>,
}

impl StreamAssembler {
    pub(crate) fn push(&mut self, bytes: &[u8], on_text: TextSink<'_>) -> Result<(), ModelError> {
        self.buffer.extend_from_slice(bytes);

        while let Some(end) = find_event_end(&self.buffer) {
            let raw = self.buffer.drain(..end).collect::<Vec<u8>>();
            let event = String::from_utf8_lossy(&raw);
            let data = event
                .lines()
                .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
                .map(str::trim_start)
                .collect::<Vec<_>>()
                .join("\n");

            if !data.is_empty() {
                self.handle(&data, on_text)?;
            }
        }

        Ok(())
    }

    fn handle(&mut self, data: &str, on_text: TextSink<'_>) -> Result<(), ModelError> {
        let event: Value = serde_json::from_str(data)
            .map_err(|error| ModelError::Decode(format!("bad stream event: {error}")))?;
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;

        match event.get("type").and_then(Value::as_str).unwrap_or_default() {
            "content_block_start" => {
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        let text = block
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        if !text.is_empty() {
                            on_text(&text);
                        }
                        self.blocks.insert(index, PartialBlock::Text(text));
                    }
                    Some("tool_use") => {
                        self.blocks.insert(
                            index,
                            PartialBlock::ToolUse {
                                id: string_field(&block, "id"),
                                name: string_field(&block, "name"),
                                json: String::new(),
                            },
                        );
                    }
                    other => debug!(block_type = ?other, "ignoring content block"),
                }
            }
            "content_block_delta" => {
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                match (delta.get("type").and_then(Value::as_str), self.blocks.get_mut(&index)) {
                    (Some("text_delta"), Some(PartialBlock::Text(text))) => {
                        let piece = string_field(&delta, "text");
                        on_text(&piece);
                        text.push_str(&piece);
                    }
                    (Some("input_json_delta"), Some(PartialBlock::ToolUse { json, .. })) => {
                        json.push_str(&string_field(&delta, "partial_json"));
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = event.pointer("/delta/stop_reason") {
                    if let Ok(reason) = serde_json::from_value::<StopReason>(reason.clone()) {
                        self.stop_reason = Some(reason);
                    }
                }
            }
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string();
                warn!(%message, "model stream reported an error");
                return Err(ModelError::Decode(message));
            }
            _ => {}
        }

        Ok(())
    }

    pub(crate) fn finish(self) -> Result<MessageResponse, ModelError> {
        let mut content = Vec::with_capacity(self.blocks.len());
        for (_, block) in self.blocks {
            match block {
                PartialBlock::Text(text) => content.push(ContentBlock::Text { text }),
                PartialBlock::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        Value::Object(Map::new())
                    } else {
                        serde_json::from_str(&json).map_err(|error| {
                            ModelError::Decode(format!("tool input for {name}: {error}"))
                        })?
                    };
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
            }
        }

        Ok(MessageResponse {
            content,
            stop_reason: self.stop_reason.unwrap_or_default(),
        })
    }
}

// Events end at a blank line. Proxies may rewrite line endings to CRLF.
fn find_event_end(buffer: &[u8]) -> Option<usize> {
    const SEPARATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\r\n", b"\n\n"];
    (0..buffer.len()).find_map(|start| {
        SEPARATORS
            .iter()
            .find(|separator| buffer[start..].starts_with(separator))
            .map(|separator| start + separator.len())
    })
}

fn string_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

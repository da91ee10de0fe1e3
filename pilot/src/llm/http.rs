//! Blocking HTTP backends for Anthropic and OpenAI-compatible APIs.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use crate::core::types::{Message, Role, ToolInvocation, truncate_chars};
use crate::io::config::{BackendConfig, Provider};
use crate::llm::{LlmBackend, LlmError, LlmRequest, LlmResponse, Usage};
use crate::tools::ToolSpec;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Error bodies containing these are not worth retrying on the same backend.
const FATAL_MARKERS: &[&str] = &[
    "quota",
    "billing",
    "credit balance",
    "insufficient_funds",
    "invalid_api_key",
    "invalid api key",
    "permission",
];

pub struct HttpBackend {
    config: BackendConfig,
    api_key: String,
    agent: ureq::Agent,
    timeout_secs: u64,
}

impl HttpBackend {
    /// Build a backend, reading its API key from the configured environment variable.
    pub fn from_config(config: &BackendConfig, timeout_secs: u64) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).with_context(|| {
            format!(
                "backend {:?} needs environment variable {}",
                config.name, config.api_key_env
            )
        })?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(timeout_secs))
            .build();
        Ok(Self {
            config: config.clone(),
            api_key,
            agent,
            timeout_secs,
        })
    }

    fn post(&self, body: &Value) -> Result<Value, LlmError> {
        let url = self.config.endpoint();
        let request = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json");
        let request = match self.config.provider {
            Provider::Anthropic => request
                .set("x-api-key", &self.api_key)
                .set("anthropic-version", ANTHROPIC_VERSION),
            Provider::OpenAi => request.set("Authorization", &format!("Bearer {}", self.api_key)),
        };
        match request.send_json(body) {
            Ok(resp) => resp
                .into_json::<Value>()
                .map_err(|e| LlmError::Malformed(e.to_string())),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(classify_status(code, &body))
            }
            Err(ureq::Error::Transport(transport)) => {
                let message = transport.to_string();
                if message.contains("timed out") {
                    Err(LlmError::Timeout(self.timeout_secs))
                } else {
                    Err(LlmError::Transient(message))
                }
            }
        }
    }
}

impl LlmBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip_all, fields(backend = %self.config.name, model = %self.config.model, messages = request.messages.len()))]
    fn complete(&self, request: &LlmRequest<'_>) -> Result<LlmResponse, LlmError> {
        let body = match self.config.provider {
            Provider::Anthropic => anthropic_body(&self.config.model, request),
            Provider::OpenAi => openai_body(&self.config.model, request),
        };
        let value = self.post(&body).inspect_err(|err| {
            warn!(err = %err, "completion request failed");
        })?;
        let response = match self.config.provider {
            Provider::Anthropic => parse_anthropic(&value),
            Provider::OpenAi => parse_openai(&value),
        }?;
        debug!(
            tool_calls = response.tool_calls.len(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "completion received"
        );
        Ok(response)
    }
}

/// Map an HTTP error status and body to a retry class.
pub fn classify_status(code: u16, body: &str) -> LlmError {
    let lower = body.to_lowercase();
    let detail = format!("HTTP {code}: {}", truncate_chars(body.trim(), 300));
    if FATAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return LlmError::Fatal(detail);
    }
    match code {
        429 => LlmError::RateLimited(detail),
        408 | 409 | 500..=599 => LlmError::Transient(detail),
        // Some providers reject a malformed tool call with 400; a retry usually succeeds.
        400 if lower.contains("tool_use_failed") => LlmError::Transient(detail),
        _ => LlmError::Fatal(detail),
    }
}

fn tool_result_content(message: &Message) -> (&str, bool) {
    match message.content.strip_prefix("ERROR: ") {
        Some(rest) => (rest, true),
        None => (message.content.as_str(), false),
    }
}

/// Request body for `/v1/messages`.
///
/// Consecutive entries with the same role are merged, as the API requires
/// strict user/assistant alternation; tool results travel as user blocks.
pub fn anthropic_body(model: &str, request: &LlmRequest<'_>) -> Value {
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in request.messages {
        let (role, blocks) = match message.role {
            Role::User => ("user", vec![json!({"type": "text", "text": message.content})]),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !message.content.trim().is_empty() {
                    blocks.push(json!({"type": "text", "text": message.content}));
                }
                for call in &message.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.call_id,
                        "name": call.name,
                        "input": Value::Object(call.arguments.clone()),
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({"type": "text", "text": "(no content)"}));
                }
                ("assistant", blocks)
            }
            Role::Tool => {
                let (content, is_error) = tool_result_content(message);
                (
                    "user",
                    vec![json!({
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": content,
                        "is_error": is_error,
                    })],
                )
            }
        };
        let same_role = messages.last().is_some_and(|(last_role, _)| *last_role == role);
        if !same_role {
            messages.push((role, blocks));
        } else if let Some((_, last_blocks)) = messages.last_mut() {
            last_blocks.extend(blocks);
        }
    }

    let tools: Vec<Value> = request
        .tools
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "input_schema": spec.parameters,
            })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": messages
            .into_iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect::<Vec<_>>(),
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools);
    }
    body
}

pub fn parse_anthropic(value: &Value) -> Result<LlmResponse, LlmError> {
    let blocks = value["content"]
        .as_array()
        .ok_or_else(|| LlmError::Malformed("missing 'content' array".to_string()))?;
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
            Some("tool_use") => tool_calls.push(ToolInvocation {
                call_id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].as_object().cloned().unwrap_or_default(),
            }),
            _ => {}
        }
    }
    Ok(LlmResponse {
        text,
        tool_calls,
        stop_reason: value["stop_reason"].as_str().map(str::to_string),
        usage: Usage {
            input_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
    })
}

fn openai_tool(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.parameters,
        }
    })
}

/// Request body for OpenAI-compatible `/chat/completions`.
pub fn openai_body(model: &str, request: &LlmRequest<'_>) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system})];
    for message in request.messages {
        let entry = match message.role {
            Role::User => json!({"role": "user", "content": message.content}),
            Role::Assistant => {
                let mut entry = json!({"role": "assistant", "content": message.content});
                if !message.tool_calls.is_empty() {
                    entry["tool_calls"] = message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.call_id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": Value::Object(call.arguments.clone()).to_string(),
                                }
                            })
                        })
                        .collect();
                }
                entry
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.content,
            }),
        };
        messages.push(entry);
    }
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = request.tools.iter().map(openai_tool).collect();
    }
    body
}

pub fn parse_openai(value: &Value) -> Result<LlmResponse, LlmError> {
    let choice = value["choices"]
        .get(0)
        .ok_or_else(|| LlmError::Malformed("missing 'choices'".to_string()))?;
    let message = &choice["message"];
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|call| {
                    // Unparseable arguments become an empty object; schema
                    // validation then reports what is missing.
                    let arguments = call["function"]["arguments"]
                        .as_str()
                        .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok())
                        .unwrap_or_default();
                    ToolInvocation {
                        call_id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: call["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        arguments,
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmResponse {
        text: message["content"].as_str().unwrap_or("").to_string(),
        tool_calls,
        stop_reason: choice["finish_reason"].as_str().map(str::to_string),
        usage: Usage {
            input_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        },
    })
}

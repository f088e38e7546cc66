use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ProviderErrorKind, Result};
use crate::model::{
    AssistantBlock, AssistantDraft, Message, StopReason, ToolResultBlock, Usage, UserBlock,
    UserContent,
};
use crate::provider::{EventStream, Provider, ProviderRequest, StreamEvent, ToolDefinition};

// ── SSE delta types for accumulation ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageStats>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    /// Reasoning/thinking tokens from models that return them as a separate
    /// field (DeepSeek-R1, Qwen3 with thinking enabled, etc.)
    reasoning_content: Option<String>,
    /// Alternative reasoning field used by OpenRouter / StepFun / others
    reasoning: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageStats {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

// ── In-progress tool call accumulator ────────────────────────────────────────

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

// ── Provider ──────────────────────────────────────────────────────────────────

/// OpenAI-compatible streaming provider over SSE. Works against any endpoint
/// speaking the chat-completions wire format (Ollama, OpenRouter, vLLM, ...).
pub struct HttpProvider {
    http: reqwest::Client,
    name: String,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            name: name.into(),
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventStream> {
        let mut body = serde_json::json!({
            "model": request.model.id,
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": build_messages(request.system_prompt.as_deref(), &request.messages),
        });
        if !request.tools.is_empty() {
            body["tools"] = tools_json(&request.tools);
            body["tool_choice"] = serde_json::json!("auto");
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.map_err(|e| {
            AgentError::provider(ProviderErrorKind::Network, e.to_string())
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::Provider {
                kind: ProviderErrorKind::from_status(status),
                message: format!("API error {status}: {text}"),
                retry_after,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = request.cancel.clone();
        let model = request.model.id.clone();
        let provider = self.name.clone();
        tokio::spawn(consume_sse(resp, tx, cancel, model, provider));

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|event| (event, rx))
        })))
    }
}

// ── SSE consumption ───────────────────────────────────────────────────────────

async fn consume_sse(
    resp: reqwest::Response,
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    model: String,
    provider: String,
) {
    let mut stream = resp.bytes_stream();

    let mut draft = AssistantDraft {
        model,
        provider,
        ..Default::default()
    };
    let _ = tx.send(StreamEvent::Start {
        partial: draft.clone(),
    });

    let mut text_buf = String::new();
    let mut thinking_buf = String::new();
    let mut pending: Vec<PendingToolCall> = Vec::new();
    let mut leftover = String::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let message = finalize(&mut draft, &text_buf, &thinking_buf, &pending)
                    .into_message(StopReason::Aborted);
                let _ = tx.send(StreamEvent::Error {
                    error: AgentError::Cancelled,
                    message,
                });
                return;
            }
            chunk = stream.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                draft.error_message = Some(e.to_string());
                let message = finalize(&mut draft, &text_buf, &thinking_buf, &pending)
                    .into_message(StopReason::Error);
                let _ = tx.send(StreamEvent::Error {
                    error: AgentError::provider(ProviderErrorKind::Network, e.to_string()),
                    message,
                });
                return;
            }
            None => break,
        };

        let raw = std::str::from_utf8(&bytes).unwrap_or("");
        // SSE may split across chunks; prepend any leftover from last iteration
        let combined = format!("{leftover}{raw}");
        leftover.clear();

        for line in combined.lines() {
            let line = line.trim();
            if line.is_empty() || line == "data: [DONE]" {
                continue;
            }
            let Some(json_str) = line.strip_prefix("data: ") else {
                continue;
            };
            // If JSON is incomplete (split mid-chunk), save for next iteration
            let chunk_val: StreamChunk = match serde_json::from_str(json_str) {
                Ok(v) => v,
                Err(_) => {
                    leftover = line.to_string();
                    continue;
                }
            };

            if let Some(usage) = chunk_val.usage {
                draft.usage = Usage {
                    input: usage.prompt_tokens.unwrap_or(0),
                    output: usage.completion_tokens.unwrap_or(0),
                    ..Default::default()
                };
                let _ = tx.send(StreamEvent::UsageDelta { usage: draft.usage });
            }

            for choice in chunk_val.choices.unwrap_or_default() {
                let Some(delta) = choice.delta else { continue };

                let reasoning = delta.reasoning_content.or(delta.reasoning);
                if let Some(reasoning) = reasoning {
                    if !reasoning.is_empty() {
                        thinking_buf.push_str(&reasoning);
                        let _ = tx.send(StreamEvent::ThinkingDelta {
                            index: 0,
                            delta: reasoning,
                        });
                    }
                }

                if let Some(text) = delta.content {
                    if !text.is_empty() {
                        text_buf.push_str(&text);
                        let _ = tx.send(StreamEvent::TextDelta {
                            index: 0,
                            delta: text,
                        });
                    }
                }

                for tc_delta in delta.tool_calls.unwrap_or_default() {
                    let idx = tc_delta.index;
                    while pending.len() <= idx {
                        pending.push(PendingToolCall::default());
                    }
                    let entry = &mut pending[idx];
                    if let Some(id) = tc_delta.id {
                        entry.id = id;
                    }
                    if let Some(func) = tc_delta.function {
                        if let Some(name) = func.name {
                            entry.name.push_str(&name);
                        }
                        if !entry.started && !entry.name.is_empty() {
                            entry.started = true;
                            let _ = tx.send(StreamEvent::ToolUseStart {
                                index: idx,
                                id: entry.id.clone(),
                                name: entry.name.clone(),
                            });
                        }
                        if let Some(args) = func.arguments {
                            entry.arguments.push_str(&args);
                            let _ = tx.send(StreamEvent::ToolUseDelta {
                                index: idx,
                                delta: args,
                            });
                        }
                    }
                }
            }
        }
    }

    let has_tools = pending.iter().any(|p| !p.name.is_empty());
    let stop_reason = if has_tools {
        StopReason::ToolUse
    } else {
        StopReason::Stop
    };
    let message = finalize(&mut draft, &text_buf, &thinking_buf, &pending).into_message(stop_reason);
    let _ = tx.send(StreamEvent::Done {
        stop_reason,
        message,
    });
}

/// Assemble the block list from the accumulated buffers.
fn finalize(
    draft: &mut AssistantDraft,
    text: &str,
    thinking: &str,
    pending: &[PendingToolCall],
) -> AssistantDraft {
    let mut content = Vec::new();
    if !thinking.is_empty() {
        content.push(AssistantBlock::Thinking {
            thinking: thinking.to_string(),
        });
    }
    if !text.is_empty() {
        content.push(AssistantBlock::Text {
            text: text.to_string(),
        });
    }
    for p in pending.iter().filter(|p| !p.name.is_empty()) {
        let input: Value =
            serde_json::from_str(&p.arguments).unwrap_or(Value::Object(Default::default()));
        content.push(AssistantBlock::ToolUse {
            id: p.id.clone(),
            name: p.name.clone(),
            input,
        });
    }
    draft.content = content;
    draft.clone()
}

// ── Wire building ─────────────────────────────────────────────────────────────

fn tools_json(tools: &[ToolDefinition]) -> Value {
    serde_json::json!(
        tools
            .iter()
            .map(|t| serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            }))
            .collect::<Vec<_>>()
    )
}

/// Flatten core messages into the chat-completions array.
fn build_messages(system: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();

    if let Some(system) = system {
        if !system.is_empty() {
            out.push(serde_json::json!({"role": "system", "content": system}));
        }
    }

    for message in messages {
        match message {
            Message::User { content } => out.push(user_json(content)),
            Message::Assistant { content, .. } => {
                let text: String = content
                    .iter()
                    .filter_map(|b| match b {
                        AssistantBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                let tool_calls: Vec<Value> = content
                    .iter()
                    .filter_map(|b| match b {
                        AssistantBlock::ToolUse { id, name, input } => Some(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();
                if tool_calls.is_empty() {
                    out.push(serde_json::json!({"role": "assistant", "content": text}));
                } else {
                    out.push(serde_json::json!({
                        "role": "assistant",
                        "content": text,
                        "tool_calls": tool_calls,
                    }));
                }
            }
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                let text: String = content
                    .iter()
                    .filter_map(|b| match b {
                        ToolResultBlock::Text { text } => Some(text.as_str()),
                        ToolResultBlock::Image { .. } => None,
                    })
                    .collect();
                out.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": text,
                }));
            }
        }
    }

    out
}

fn user_json(content: &UserContent) -> Value {
    match content {
        UserContent::Text(text) => serde_json::json!({"role": "user", "content": text}),
        UserContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .map(|b| match b {
                    UserBlock::Text { text } => {
                        serde_json::json!({"type": "text", "text": text})
                    }
                    UserBlock::Image { media_type, data } => serde_json::json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{media_type};base64,{data}")},
                    }),
                })
                .collect();
            serde_json::json!({"role": "user", "content": parts})
        }
    }
}

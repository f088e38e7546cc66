/// Streaming provider and tool interfaces.
///
/// The core is generic over the provider wire format: anything that can turn
/// (model, messages, options) into an ordered stream of `StreamEvent`s can
/// drive a session. Tests use a scripted stub; `client.rs` ships an
/// OpenAI-compatible SSE implementation.
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::model::{
    AssistantDraft, Message, ModelRef, StopReason, ThinkingLevel, ToolResultBlock, Usage,
};

// ── Stream events ─────────────────────────────────────────────────────────────

/// Incremental events from one streaming completion, delivered in order.
#[derive(Debug)]
pub enum StreamEvent {
    /// The stream opened; carries whatever partial state is already known.
    Start { partial: AssistantDraft },
    TextDelta { index: usize, delta: String },
    ThinkingDelta { index: usize, delta: String },
    /// A tool_use block opened at `index`.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },
    /// A fragment of the tool_use block's JSON arguments.
    ToolUseDelta { index: usize, delta: String },
    UsageDelta { usage: Usage },
    /// Terminal: the completed assistant message.
    Done {
        stop_reason: StopReason,
        message: Message,
    },
    /// Terminal: the stream failed or was aborted. The message is the
    /// assistant-so-far with `stop_reason ∈ {aborted, error}`.
    Error {
        error: AgentError,
        message: Message,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

pub type EventStream = BoxStream<'static, StreamEvent>;

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: ModelRef,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub thinking_level: ThinkingLevel,
    pub max_tokens: Option<u32>,
    /// Cancelling this token must terminate the stream with an `Error` event
    /// whose message has `stop_reason = aborted`.
    pub cancel: CancellationToken,
}

impl ProviderRequest {
    pub fn new(model: ModelRef, messages: Vec<Message>) -> Self {
        Self {
            model,
            messages,
            system_prompt: None,
            tools: Vec::new(),
            thinking_level: ThinkingLevel::default(),
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A streaming LLM endpoint.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streaming completion. Errors returned here are pre-stream
    /// failures (connect, auth); once a stream exists, failures arrive as
    /// `StreamEvent::Error`.
    async fn stream(&self, request: ProviderRequest) -> Result<EventStream>;
}

/// Drain a stream to its terminal event and return the final message.
/// Used by the compaction engine, which wants a completion rather than
/// incremental delivery.
pub async fn collect_stream(mut stream: EventStream) -> Result<Message> {
    use futures_util::StreamExt;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Done { message, .. } => return Ok(message),
            StreamEvent::Error { error, .. } => return Err(error),
            _ => {}
        }
    }
    Err(AgentError::provider(
        crate::error::ProviderErrorKind::Network,
        "stream ended without a terminal event",
    ))
}

// ── Tool interface ────────────────────────────────────────────────────────────

/// Name, description, and JSON-schema parameters registered at
/// tool-construction time and sent to the model.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Result of one tool execution, fed back to the model as a ToolResult.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentToolResult {
    pub content: Vec<ToolResultBlock>,
    /// Opaque structured payload for frontends; never sent to the model.
    pub details: Option<Value>,
    pub is_error: bool,
}

impl AgentToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::Text { text: text.into() }],
            details: None,
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::Text { text: text.into() }],
            details: None,
            is_error: true,
        }
    }
}

/// Ambient state tools may consult. Optional — tools that don't need it
/// accept None.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub cwd: String,
}

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(
        &self,
        tool_call_id: &str,
        params: Value,
        cancel: CancellationToken,
        context: Option<ToolContext>,
    ) -> anyhow::Result<AgentToolResult>;
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Content blocks ────────────────────────────────────────────────────────────

/// User-authored content: either plain text or a mixed list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserBlock>),
}

impl From<&str> for UserContent {
    fn from(s: &str) -> Self {
        UserContent::Text(s.to_string())
    }
}

impl From<String> for UserContent {
    fn from(s: String) -> Self {
        UserContent::Text(s)
    }
}

impl UserContent {
    /// Concatenated text of all text blocks (images are skipped).
    pub fn as_text(&self) -> String {
        match self {
            UserContent::Text(t) => t.clone(),
            UserContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    UserBlock::Text { text } => Some(text.as_str()),
                    UserBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    Text {
        text: String,
    },
    /// Binary image payload, base64-encoded on the wire and on disk.
    Image {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
    },
}

impl UserBlock {
    /// Build an image block from raw bytes.
    pub fn image(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine;
        UserBlock::Image {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mediaType")]
        media_type: String,
        data: String,
    },
}

// ── Usage / stop reason ───────────────────────────────────────────────────────

/// Token accounting as reported by the provider for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default, rename = "cacheRead")]
    pub cache_read: u64,
    #[serde(default, rename = "cacheWrite")]
    pub cache_write: u64,
}

impl Usage {
    /// Total context footprint: input + output + cache read + cache write.
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    MaxTokens,
    ToolUse,
    Aborted,
    Error,
}

// ── Thinking level / model reference ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// A provider/model pair, recorded in-line so context at any leaf is
/// reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            id: id.into(),
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// The conversational payload of a message entry. All polymorphism is tagged
/// variants; the core never dispatches on subtypes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: UserContent,
    },
    Assistant {
        content: Vec<AssistantBlock>,
        model: String,
        provider: String,
        usage: Usage,
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
        #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        content: Vec<ToolResultBlock>,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
}

impl Message {
    pub fn user(content: impl Into<UserContent>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Message::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: vec![ToolResultBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn tool_error(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Message::ToolResult {
            tool_call_id: tool_call_id.into(),
            content: vec![ToolResultBlock::Text { text: text.into() }],
            is_error: true,
        }
    }

    /// Concatenated text of the message (assistant text blocks, user text,
    /// or tool result text).
    pub fn text(&self) -> String {
        match self {
            Message::User { content } => content.as_text(),
            Message::Assistant { content, .. } => content
                .iter()
                .filter_map(|b| match b {
                    AssistantBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            Message::ToolResult { content, .. } => content
                .iter()
                .filter_map(|b| match b {
                    ToolResultBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Tool-use blocks of an assistant message, in block order.
    pub fn tool_uses(&self) -> Vec<&AssistantBlock> {
        match self {
            Message::Assistant { content, .. } => content
                .iter()
                .filter(|b| matches!(b, AssistantBlock::ToolUse { .. }))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }

    pub fn is_errored_assistant(&self) -> bool {
        matches!(
            self,
            Message::Assistant {
                stop_reason: StopReason::Error,
                ..
            }
        )
    }
}

/// A fully-formed assistant message under construction during streaming.
/// Used by providers to report partial state on `start` and `error`.
#[derive(Debug, Clone, Default)]
pub struct AssistantDraft {
    pub content: Vec<AssistantBlock>,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
    pub error_message: Option<String>,
}

impl AssistantDraft {
    pub fn into_message(self, stop_reason: StopReason) -> Message {
        Message::Assistant {
            content: self.content,
            model: self.model,
            provider: self.provider,
            usage: self.usage,
            stop_reason,
            error_message: self.error_message,
        }
    }
}

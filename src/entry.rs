/// Log entries — the atomic, immutable records of the conversation log.
///
/// Every entry carries an 8-hex id unique within its log and a nullable
/// `parent_id` pointing strictly backwards, so the entries form a tree with
/// edges into the past. Branches are reconstructed from parent pointers; the
/// on-disk order is append order.
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Message, UserContent};

/// Current on-disk schema version, stamped into the header.
pub const CURRENT_SESSION_VERSION: u32 = 3;

fn default_session_version() -> u32 {
    1
}

// ── Header ────────────────────────────────────────────────────────────────────

/// First line of every session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    #[serde(rename = "type")]
    pub type_field: String,
    #[serde(default = "default_session_version")]
    pub version: u32,
    pub id: String,
    pub timestamp: String,
    pub cwd: String,
    #[serde(rename = "parentSession", skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            type_field: "session".to_string(),
            version: CURRENT_SESSION_VERSION,
            id: id.into(),
            timestamp: now_iso(),
            cwd: cwd.into(),
            parent_session: None,
        }
    }
}

// ── Entries ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEntry {
    #[serde(rename = "message")]
    Message {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        message: Message,
    },
    #[serde(rename = "model_change")]
    ModelChange {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },
    #[serde(rename = "thinking_level_change")]
    ThinkingLevelChange {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        #[serde(rename = "thinkingLevel")]
        thinking_level: crate::model::ThinkingLevel,
    },
    #[serde(rename = "compaction")]
    Compaction {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        summary: String,
        /// Entries strictly before this id are replaced by the summary at
        /// context-build time. None collapses the whole prefix.
        #[serde(rename = "firstKeptEntryId", skip_serializing_if = "Option::is_none")]
        first_kept_entry_id: Option<String>,
        #[serde(rename = "tokensBefore")]
        tokens_before: u64,
        /// Set when the cut point falls inside a multi-assistant turn that
        /// could not be rewound to a turn boundary.
        #[serde(rename = "isSplitTurn", default, skip_serializing_if = "std::ops::Not::not")]
        is_split_turn: bool,
        #[serde(rename = "fromHook", default, skip_serializing_if = "std::ops::Not::not")]
        from_hook: bool,
    },
    #[serde(rename = "branch_summary")]
    BranchSummary {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        /// Tip of the abandoned sibling branch.
        #[serde(rename = "fromId")]
        from_id: String,
        summary: String,
    },
    #[serde(rename = "custom")]
    Custom {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        #[serde(rename = "customType")]
        custom_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    #[serde(rename = "custom_message")]
    CustomMessage {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        #[serde(rename = "customType")]
        custom_type: String,
        content: UserContent,
        /// Whether a frontend should render this message. It always
        /// participates in the LLM context regardless.
        #[serde(default = "default_display")]
        display: bool,
    },
    #[serde(rename = "label")]
    Label {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        #[serde(rename = "targetId")]
        target_id: String,
        /// None clears a previously set label.
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    #[serde(rename = "session_info")]
    SessionInfo {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: Option<String>,
        timestamp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

fn default_display() -> bool {
    true
}

impl SessionEntry {
    pub fn id(&self) -> &str {
        match self {
            SessionEntry::Message { id, .. }
            | SessionEntry::ModelChange { id, .. }
            | SessionEntry::ThinkingLevelChange { id, .. }
            | SessionEntry::Compaction { id, .. }
            | SessionEntry::BranchSummary { id, .. }
            | SessionEntry::Custom { id, .. }
            | SessionEntry::CustomMessage { id, .. }
            | SessionEntry::Label { id, .. }
            | SessionEntry::SessionInfo { id, .. } => id,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            SessionEntry::Message { parent_id, .. }
            | SessionEntry::ModelChange { parent_id, .. }
            | SessionEntry::ThinkingLevelChange { parent_id, .. }
            | SessionEntry::Compaction { parent_id, .. }
            | SessionEntry::BranchSummary { parent_id, .. }
            | SessionEntry::Custom { parent_id, .. }
            | SessionEntry::CustomMessage { parent_id, .. }
            | SessionEntry::Label { parent_id, .. }
            | SessionEntry::SessionInfo { parent_id, .. } => parent_id.as_deref(),
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            SessionEntry::Message { timestamp, .. }
            | SessionEntry::ModelChange { timestamp, .. }
            | SessionEntry::ThinkingLevelChange { timestamp, .. }
            | SessionEntry::Compaction { timestamp, .. }
            | SessionEntry::BranchSummary { timestamp, .. }
            | SessionEntry::Custom { timestamp, .. }
            | SessionEntry::CustomMessage { timestamp, .. }
            | SessionEntry::Label { timestamp, .. }
            | SessionEntry::SessionInfo { timestamp, .. } => timestamp,
        }
    }

    pub(crate) fn set_identity(&mut self, new_id: String, new_parent: Option<String>) {
        match self {
            SessionEntry::Message { id, parent_id, .. }
            | SessionEntry::ModelChange { id, parent_id, .. }
            | SessionEntry::ThinkingLevelChange { id, parent_id, .. }
            | SessionEntry::Compaction { id, parent_id, .. }
            | SessionEntry::BranchSummary { id, parent_id, .. }
            | SessionEntry::Custom { id, parent_id, .. }
            | SessionEntry::CustomMessage { id, parent_id, .. }
            | SessionEntry::Label { id, parent_id, .. }
            | SessionEntry::SessionInfo { id, parent_id, .. } => {
                *id = new_id;
                *parent_id = new_parent;
            }
        }
    }

    pub fn is_errored_assistant(&self) -> bool {
        matches!(self, SessionEntry::Message { message, .. } if message.is_errored_assistant())
    }
}

// ── Id generation ─────────────────────────────────────────────────────────────

const ID_ATTEMPTS: usize = 100;

/// Generate an 8-hex entry id unique within `taken`. Collisions retry up to
/// 100 times, then fall back to a 16-hex id.
pub fn generate_entry_id(taken: &HashSet<String>) -> String {
    for _ in 0..ID_ATTEMPTS {
        let id = format!("{:08x}", rand::random::<u32>());
        if !taken.contains(&id) {
            return id;
        }
    }
    format!("{:016x}", rand::random::<u64>())
}

/// Current time as an ISO-8601 UTC timestamp.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

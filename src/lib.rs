//! braidcode — the branchable-session core of a conversational coding agent.
//!
//! The crate presents one contract, [`Session`]: a frontend prompts it,
//! subscribes to its events, steers or aborts the in-flight turn, branches
//! the conversation tree, and compacts the context. Persistence is an
//! append-only JSONL log of parent-linked entries; the branch index, context
//! builder, turn engine, tool dispatcher, compaction engine, retry
//! controller, and hook runtime all live behind the façade.

pub mod client;
pub mod compact;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod events;
pub mod hooks;
pub mod index;
pub mod model;
pub mod provider;
pub mod retry;
pub mod session;
pub mod store;
pub mod tools;
pub mod turn;

pub use client::HttpProvider;
pub use compact::CompactionConfig;
pub use config::{SessionConfig, Settings};
pub use context::BuiltContext;
pub use entry::{CURRENT_SESSION_VERSION, SessionEntry, SessionHeader};
pub use error::{AgentError, ProviderErrorKind, Result};
pub use events::SessionEvent;
pub use hooks::{
    BeforeCompactOutcome, HookApi, HookBuilder, HookDecision, HookEvent, HookEventKind,
    HookRuntime, UiBridge,
};
pub use index::TreeNode;
pub use model::{
    AssistantBlock, Message, ModelRef, StopReason, ThinkingLevel, ToolResultBlock, Usage,
    UserBlock, UserContent,
};
pub use provider::{
    AgentTool, AgentToolResult, EventStream, Provider, ProviderRequest, StreamEvent,
    ToolContext, ToolDefinition,
};
pub use retry::{RetryConfig, RetryController, RetryDecision};
pub use session::{Session, SessionBuilder};
pub use store::{list_session_files, list_sessions};
pub use tools::{DispatchOptions, DispatchOutcome, ToolCallRequest, ToolRegistry};
pub use turn::TurnPhase;

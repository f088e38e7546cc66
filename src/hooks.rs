/// Hook runtime — typed extension points around the turn engine.
///
/// A hook is a named bundle of async handlers keyed by event kind, installed
/// at startup through `HookBuilder`. Dispatch is registration-ordered and
/// deterministic: the first veto/cancel wins, context filters compose left
/// to right, everything else is notification-only. A handler that fails or
/// times out is reported on the session's event bus and never aborts the
/// turn.
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::time::timeout;
use tracing::warn;

use crate::entry::SessionEntry;
use crate::error::Result;
use crate::events::SessionEvent;
use crate::model::{Message, ModelRef, UserContent};
use crate::session::SessionInner;

const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEventKind {
    SessionStart,
    BeforeAgentStart,
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    ToolCall,
    ToolResult,
    Context,
    SessionBeforeCompact,
    SessionCompact,
}

impl HookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session_start",
            Self::BeforeAgentStart => "before_agent_start",
            Self::AgentStart => "agent_start",
            Self::AgentEnd => "agent_end",
            Self::TurnStart => "turn_start",
            Self::TurnEnd => "turn_end",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Context => "context",
            Self::SessionBeforeCompact => "session_before_compact",
            Self::SessionCompact => "session_compact",
        }
    }
}

impl std::fmt::Display for HookEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed event payload handed to handlers.
#[derive(Debug, Clone)]
pub enum HookEvent {
    SessionStart {
        session_id: String,
    },
    /// Fired before the stream loop; handlers may inject hidden
    /// custom messages (plan-mode context and the like).
    BeforeAgentStart {
        prompt: Message,
    },
    AgentStart,
    AgentEnd,
    TurnStart {
        turn_index: u32,
    },
    TurnEnd {
        turn_index: u32,
    },
    /// Fired per tool_use block; a `BlockTool` decision vetoes execution.
    ToolCall {
        tool_call_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        is_error: bool,
    },
    /// Last-chance filter over the built message list.
    Context {
        messages: Vec<Message>,
    },
    SessionBeforeCompact {
        tokens_before: u64,
    },
    SessionCompact {
        entry_id: String,
        from_hook: bool,
    },
}

impl HookEvent {
    pub fn kind(&self) -> HookEventKind {
        match self {
            HookEvent::SessionStart { .. } => HookEventKind::SessionStart,
            HookEvent::BeforeAgentStart { .. } => HookEventKind::BeforeAgentStart,
            HookEvent::AgentStart => HookEventKind::AgentStart,
            HookEvent::AgentEnd => HookEventKind::AgentEnd,
            HookEvent::TurnStart { .. } => HookEventKind::TurnStart,
            HookEvent::TurnEnd { .. } => HookEventKind::TurnEnd,
            HookEvent::ToolCall { .. } => HookEventKind::ToolCall,
            HookEvent::ToolResult { .. } => HookEventKind::ToolResult,
            HookEvent::Context { .. } => HookEventKind::Context,
            HookEvent::SessionBeforeCompact { .. } => HookEventKind::SessionBeforeCompact,
            HookEvent::SessionCompact { .. } => HookEventKind::SessionCompact,
        }
    }
}

// ── Decisions ─────────────────────────────────────────────────────────────────

/// What a handler asks the runtime to do. Merge rules are per event kind:
/// first `BlockTool`/`CancelCompaction`/`Summary` wins; `ReplaceContext`
/// composes; `InjectMessages` concatenates.
#[derive(Debug, Clone)]
pub enum HookDecision {
    Continue,
    BlockTool { reason: String },
    CancelCompaction { reason: String },
    /// Precomputed compaction summary, used verbatim with `from_hook = true`.
    Summary { summary: String },
    ReplaceContext { messages: Vec<Message> },
    InjectMessages { messages: Vec<(String, UserContent)> },
}

/// Outcome of `session_before_compact` arbitration.
#[derive(Debug, Clone)]
pub enum BeforeCompactOutcome {
    Proceed,
    Cancelled { reason: String },
    Summary { summary: String },
}

// ── Hook registration ─────────────────────────────────────────────────────────

type Handler =
    Arc<dyn Fn(HookEvent, HookApi) -> BoxFuture<'static, anyhow::Result<HookDecision>> + Send + Sync>;

/// A frontend-visible command contributed by a hook. Parsing the command
/// line is the frontend's job; the core only stores the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutSpec {
    pub keys: String,
    pub description: String,
}

pub struct Hook {
    pub name: String,
    handlers: Vec<(HookEventKind, Handler)>,
    commands: Vec<CommandSpec>,
    shortcuts: Vec<ShortcutSpec>,
    handler_timeout: Duration,
}

pub struct HookBuilder {
    hook: Hook,
}

impl HookBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            hook: Hook {
                name: name.into(),
                handlers: Vec::new(),
                commands: Vec::new(),
                shortcuts: Vec::new(),
                handler_timeout: HANDLER_TIMEOUT,
            },
        }
    }

    /// Register a handler for one event kind. Handlers run in registration
    /// order across all hooks.
    pub fn on<F, Fut>(mut self, kind: HookEventKind, handler: F) -> Self
    where
        F: Fn(HookEvent, HookApi) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<HookDecision>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event, api| Box::pin(handler(event, api)));
        self.hook.handlers.push((kind, handler));
        self
    }

    pub fn register_command(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.hook.commands.push(CommandSpec {
            name: name.into(),
            description: description.into(),
        });
        self
    }

    pub fn register_shortcut(
        mut self,
        keys: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.hook.shortcuts.push(ShortcutSpec {
            keys: keys.into(),
            description: description.into(),
        });
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.hook.handler_timeout = timeout;
        self
    }

    pub fn build(self) -> Hook {
        self.hook
    }
}

// ── Runtime ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct HookRuntime {
    hooks: Vec<Hook>,
}

impl HookRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, hook: Hook) {
        self.hooks.push(hook);
    }

    pub fn commands(&self) -> Vec<CommandSpec> {
        self.hooks.iter().flat_map(|h| h.commands.clone()).collect()
    }

    pub fn shortcuts(&self) -> Vec<ShortcutSpec> {
        self.hooks.iter().flat_map(|h| h.shortcuts.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.iter().all(|h| h.handlers.is_empty())
    }

    /// Invoke all handlers for an event in registration order and return
    /// their decisions. Failures are reported and skipped.
    pub async fn dispatch(&self, event: &HookEvent, api: &HookApi) -> Vec<HookDecision> {
        let kind = event.kind();
        let mut decisions = Vec::new();
        for hook in &self.hooks {
            for (handler_kind, handler) in &hook.handlers {
                if *handler_kind != kind {
                    continue;
                }
                let run = handler(event.clone(), api.clone());
                match timeout(hook.handler_timeout, run).await {
                    Ok(Ok(decision)) => decisions.push(decision),
                    Ok(Err(error)) => {
                        self.report_error(api, &hook.name, kind, &error.to_string());
                    }
                    Err(_) => {
                        self.report_error(api, &hook.name, kind, "handler timed out");
                    }
                }
            }
        }
        decisions
    }

    /// First veto wins; None means the call may run.
    pub async fn gate_tool_call(
        &self,
        tool_call_id: &str,
        name: &str,
        input: &Value,
        api: &HookApi,
    ) -> Option<String> {
        let event = HookEvent::ToolCall {
            tool_call_id: tool_call_id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        };
        self.dispatch(&event, api)
            .await
            .into_iter()
            .find_map(|d| match d {
                HookDecision::BlockTool { reason } => Some(reason),
                _ => None,
            })
    }

    /// Filters compose left-to-right: each handler sees the previous
    /// handler's output.
    pub async fn filter_context(&self, mut messages: Vec<Message>, api: &HookApi) -> Vec<Message> {
        for hook in &self.hooks {
            for (handler_kind, handler) in &hook.handlers {
                if *handler_kind != HookEventKind::Context {
                    continue;
                }
                let event = HookEvent::Context {
                    messages: messages.clone(),
                };
                let run = handler(event, api.clone());
                match timeout(hook.handler_timeout, run).await {
                    Ok(Ok(HookDecision::ReplaceContext { messages: replaced })) => {
                        messages = replaced;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        self.report_error(api, &hook.name, HookEventKind::Context, &error.to_string());
                    }
                    Err(_) => {
                        self.report_error(api, &hook.name, HookEventKind::Context, "handler timed out");
                    }
                }
            }
        }
        messages
    }

    /// Compaction arbitration: first cancel or supplied summary wins.
    pub async fn before_compact(&self, tokens_before: u64, api: &HookApi) -> BeforeCompactOutcome {
        let event = HookEvent::SessionBeforeCompact { tokens_before };
        for decision in self.dispatch(&event, api).await {
            match decision {
                HookDecision::CancelCompaction { reason } => {
                    return BeforeCompactOutcome::Cancelled { reason };
                }
                HookDecision::Summary { summary } => {
                    return BeforeCompactOutcome::Summary { summary };
                }
                _ => {}
            }
        }
        BeforeCompactOutcome::Proceed
    }

    /// Pre-messages injected before the stream loop, concatenated across
    /// hooks in order.
    pub async fn collect_pre_messages(
        &self,
        prompt: &Message,
        api: &HookApi,
    ) -> Vec<(String, UserContent)> {
        let event = HookEvent::BeforeAgentStart {
            prompt: prompt.clone(),
        };
        self.dispatch(&event, api)
            .await
            .into_iter()
            .flat_map(|d| match d {
                HookDecision::InjectMessages { messages } => messages,
                _ => Vec::new(),
            })
            .collect()
    }

    fn report_error(&self, api: &HookApi, hook: &str, kind: HookEventKind, message: &str) {
        warn!(hook, event = %kind, message, "hook handler failed");
        api.emit(SessionEvent::HookError {
            hook: hook.to_string(),
            event: kind.to_string(),
            message: message.to_string(),
        });
    }
}

// ── UI bridge ─────────────────────────────────────────────────────────────────

/// The whole UI contract the core knows about: a frontend may draw status
/// text (via the event stream) and answer choice prompts. Sessions without
/// a bridge answer every choice with None.
#[async_trait]
pub trait UiBridge: Send + Sync {
    /// Ask the user to pick one of `options`. None means dismissed.
    async fn choose(&self, prompt: &str, options: &[String]) -> Option<usize>;
}

// ── Hook context ──────────────────────────────────────────────────────────────

/// Capability handle passed to every handler. Holds only a weak reference to
/// the session, so hooks never keep a dropped session alive.
#[derive(Clone)]
pub struct HookApi {
    pub(crate) inner: Weak<SessionInner>,
}

impl HookApi {
    pub(crate) fn new(inner: Weak<SessionInner>) -> Self {
        Self { inner }
    }

    fn upgrade(&self) -> Option<Arc<SessionInner>> {
        self.inner.upgrade()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(inner) = self.upgrade() {
            inner.events.emit(event);
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.upgrade().map(|inner| inner.session_id())
    }

    pub fn is_idle(&self) -> bool {
        self.upgrade().map(|inner| inner.is_idle()).unwrap_or(true)
    }

    /// The effective model at the current leaf.
    pub fn current_model(&self) -> Option<ModelRef> {
        self.upgrade().and_then(|inner| inner.current_model())
    }

    /// Model registry entries loaded at session construction.
    pub fn models(&self) -> Vec<ModelRef> {
        self.upgrade()
            .map(|inner| inner.models.clone())
            .unwrap_or_default()
    }

    /// Status text for the frontend; None clears it.
    pub fn set_status(&self, text: Option<String>) {
        self.emit(SessionEvent::Status { text });
    }

    /// Ask the user to pick an option through the session's UI bridge.
    pub async fn choose(&self, prompt: &str, options: &[String]) -> Option<usize> {
        let bridge = self.upgrade().and_then(|inner| inner.ui.clone())?;
        bridge.choose(prompt, options).await
    }

    /// Append a custom message entry (participates in the LLM context).
    pub fn send_message(
        &self,
        custom_type: &str,
        content: UserContent,
        display: bool,
    ) -> Result<Option<String>> {
        match self.upgrade() {
            Some(inner) => Ok(Some(inner.append_custom_message(
                custom_type,
                content,
                display,
            )?)),
            None => Ok(None),
        }
    }

    /// Append an opaque custom entry (never enters the LLM context).
    pub fn append_entry(
        &self,
        custom_type: &str,
        data: Option<Value>,
    ) -> Result<Option<String>> {
        match self.upgrade() {
            Some(inner) => Ok(Some(inner.append_custom(custom_type, data)?)),
            None => Ok(None),
        }
    }

    /// Restrict the tool set offered to the model. None restores all tools.
    pub fn set_active_tools(&self, names: Option<Vec<String>>) {
        if let Some(inner) = self.upgrade() {
            inner.set_active_tools(names);
        }
    }

    /// Recent log entries, for read-only inspection.
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.upgrade()
            .map(|inner| inner.entries_snapshot())
            .unwrap_or_default()
    }
}

/// Ordered lookup of hook bundles by name, used by discovery.
pub fn hooks_by_name(runtime: &HookRuntime) -> HashMap<String, usize> {
    runtime
        .hooks
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.clone(), i))
        .collect()
}

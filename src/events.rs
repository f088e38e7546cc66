/// Session events — the fan-out channel frontends subscribe to.
///
/// Subscribers receive events in the order the turn engine emits them; the
/// bus never blocks the engine (unbounded senders, closed receivers pruned
/// on the next emit).
use std::sync::Mutex;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::model::{Message, ModelRef, Usage};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
    },
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    /// An entry landed in the log.
    MessageAppended {
        entry_id: String,
        message: Message,
    },
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    ToolUseStart {
        tool_call_id: String,
        name: String,
    },
    UsageDelta {
        usage: Usage,
    },
    ToolExecutionStart {
        tool_call_id: String,
        name: String,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        name: String,
        is_error: bool,
    },
    /// A hook vetoed a tool call.
    ToolCallBlocked {
        tool_call_id: String,
        name: String,
        reason: String,
    },
    AutoRetryStart {
        attempt: u32,
        delay_ms: u64,
        error: String,
        model: ModelRef,
    },
    AutoRetryEnd {
        success: bool,
        attempt: u32,
        error: Option<String>,
    },
    /// Automatic compaction only; manual `compact()` emits just `Compacted`.
    AutoCompactionStart,
    AutoCompactionEnd {
        success: bool,
    },
    Compacted {
        entry_id: String,
        tokens_before: u64,
        from_hook: bool,
    },
    /// A hook handler failed; the turn continues.
    HookError {
        hook: String,
        event: String,
        message: String,
    },
    /// Status text set by a hook for the frontend to draw.
    Status {
        text: Option<String>,
    },
}

// ── Bus ───────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct EventBus {
    senders: Mutex<Vec<UnboundedSender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, event: SessionEvent) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

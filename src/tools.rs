/// Tool registry and dispatcher.
///
/// Tools register once at construction; the dispatcher executes the
/// `tool_use` blocks of one assistant message concurrently, each under its
/// own child cancellation token. Hooks gate each call first; a veto becomes
/// a synthetic error ToolResult without execution. Results are delivered in
/// completion order unless deterministic block-index ordering is requested.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hooks::{HookApi, HookRuntime};
use crate::provider::{AgentTool, AgentToolResult, ToolContext, ToolDefinition};

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
    order: Vec<String>,
    /// When set, only these tools are offered to the model. Hooks toggle
    /// this through `set_active_tools`.
    active: Mutex<Option<HashSet<String>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        let name = tool.definition().name;
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    /// Definitions sent to the model, in registration order, honoring the
    /// active set.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let active = self.active.lock().unwrap();
        self.order
            .iter()
            .filter(|name| match &*active {
                Some(set) => set.contains(*name),
                None => true,
            })
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.definition())
            .collect()
    }

    pub fn set_active(&self, names: Option<Vec<String>>) {
        *self.active.lock().unwrap() = names.map(|n| n.into_iter().collect());
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// One tool_use block lifted out of an assistant message.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub tool_call_id: String,
    pub name: String,
    pub input: Value,
    /// Position of the block in the assistant message, for deterministic
    /// ordering when requested.
    pub block_index: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub tool_call_id: String,
    pub name: String,
    pub block_index: usize,
    pub result: AgentToolResult,
    /// Veto reason when a hook blocked the call; execution was skipped.
    pub blocked: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub timeout: Option<Duration>,
    pub sort_by_block_index: bool,
    pub context: Option<ToolContext>,
}

/// Execute the calls of one assistant message. Returns a receiver that
/// yields one outcome per call; the channel closes when all calls settled
/// or cancellation propagated.
pub fn dispatch(
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookRuntime>,
    api: HookApi,
    calls: Vec<ToolCallRequest>,
    cancel: CancellationToken,
    options: DispatchOptions,
) -> mpsc::UnboundedReceiver<DispatchOutcome> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut join_set: JoinSet<DispatchOutcome> = JoinSet::new();

        for call in calls {
            // Hooks arbitrate each call before it runs.
            if let Some(reason) = hooks
                .gate_tool_call(&call.tool_call_id, &call.name, &call.input, &api)
                .await
            {
                debug!(tool = %call.name, reason = %reason, "tool call blocked by hook");
                let outcome = DispatchOutcome {
                    result: AgentToolResult::error(format!("[Blocked by hook: {reason}]")),
                    blocked: Some(reason),
                    tool_call_id: call.tool_call_id,
                    name: call.name,
                    block_index: call.block_index,
                };
                if options.sort_by_block_index {
                    join_set.spawn(async move { outcome });
                } else if tx.send(outcome).is_err() {
                    return;
                }
                continue;
            }

            let Some(tool) = registry.get(&call.name) else {
                let outcome = DispatchOutcome {
                    result: AgentToolResult::error(format!("[Unknown tool: '{}']", call.name)),
                    blocked: None,
                    tool_call_id: call.tool_call_id,
                    name: call.name,
                    block_index: call.block_index,
                };
                if options.sort_by_block_index {
                    join_set.spawn(async move { outcome });
                } else if tx.send(outcome).is_err() {
                    return;
                }
                continue;
            };

            let call_cancel = cancel.child_token();
            let call_timeout = options.timeout;
            let context = options.context.clone();
            join_set.spawn(async move {
                let result =
                    run_one(tool, &call, call_cancel, call_timeout, context).await;
                DispatchOutcome {
                    result,
                    blocked: None,
                    tool_call_id: call.tool_call_id,
                    name: call.name,
                    block_index: call.block_index,
                }
            });
        }

        if options.sort_by_block_index {
            let mut outcomes = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                if let Ok(outcome) = joined {
                    outcomes.push(outcome);
                }
            }
            outcomes.sort_by_key(|o| o.block_index);
            for outcome in outcomes {
                if tx.send(outcome).is_err() {
                    return;
                }
            }
        } else {
            while let Some(joined) = join_set.join_next().await {
                if let Ok(outcome) = joined {
                    if tx.send(outcome).is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

/// Run a single tool with cancellation and optional timeout. Failures never
/// escape as errors — the model sees them as error ToolResults and handles
/// them itself.
async fn run_one(
    tool: Arc<dyn AgentTool>,
    call: &ToolCallRequest,
    cancel: CancellationToken,
    call_timeout: Option<Duration>,
    context: Option<ToolContext>,
) -> AgentToolResult {
    let execution = async {
        match tool
            .execute(&call.tool_call_id, call.input.clone(), cancel.clone(), context)
            .await
        {
            Ok(result) => result,
            Err(e) => AgentToolResult::error(format!("[Tool error: {e}]")),
        }
    };

    let with_cancel = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => AgentToolResult::error("[Tool cancelled]"),
            result = execution => result,
        }
    };

    match call_timeout {
        Some(limit) => match tokio::time::timeout(limit, with_cancel).await {
            Ok(result) => result,
            Err(_) => AgentToolResult::error(format!(
                "[Tool timed out after {}s]",
                limit.as_secs()
            )),
        },
        None => with_cancel.await,
    }
}

/// Turn engine — drives one agent loop: prompt → streaming → tool
/// round-trips → terminal assistant, then queued steers.
///
/// Single-flight: the session reserves the flight slot before calling in
/// here, so at most one loop runs per session. Cancellation flows through a
/// per-turn token; the stream must answer it with an aborted assistant,
/// tools with error results, and retry waits are interruptible.
use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compact;
use crate::context;
use crate::error::{AgentError, ProviderErrorKind, Result};
use crate::events::SessionEvent;
use crate::hooks::{HookApi, HookEvent};
use crate::model::{AssistantBlock, AssistantDraft, Message, StopReason, UserContent};
use crate::provider::{ProviderRequest, StreamEvent, ToolContext};
use crate::retry::{RetryController, RetryDecision};
use crate::session::SessionInner;
use crate::tools::{DispatchOptions, ToolCallRequest, dispatch};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    Streaming,
    AwaitingToolResults,
    /// Compaction in progress between turns.
    Suspended,
    RetryWait,
}

#[derive(Default)]
pub(crate) struct TurnState {
    pub phase: TurnPhase,
    pub cancel: Option<CancellationToken>,
    /// Messages queued while streaming, fed as subsequent turns (FIFO).
    pub steer: VecDeque<UserContent>,
    /// Messages scheduled for after the loop next reaches idle.
    pub follow_up: VecDeque<UserContent>,
    pub turn_index: u32,
}

impl TurnState {
    pub fn pending_count(&self) -> usize {
        self.steer.len() + self.follow_up.len()
    }
}

fn set_phase(inner: &Arc<SessionInner>, phase: TurnPhase) {
    inner.turn.lock().unwrap().phase = phase;
}

fn fresh_cancel(inner: &Arc<SessionInner>) -> CancellationToken {
    let token = CancellationToken::new();
    inner.turn.lock().unwrap().cancel = Some(token.clone());
    token
}

// ── Agent loop ────────────────────────────────────────────────────────────────

/// Run the agent loop for an initial user message plus any queued steers and
/// follow-ups. The caller has already moved the phase out of Idle; this
/// function owns it until returning, and always leaves the session Idle.
pub(crate) async fn run_agent(inner: &Arc<SessionInner>, initial: UserContent) -> Result<()> {
    let api = inner.hook_api();

    let mut outcome = Ok(());
    let mut next = Some(initial);
    while let Some(content) = next {
        match run_prompt(inner, content, &api).await {
            Ok(()) => {}
            Err(error) => {
                outcome = Err(error);
                break;
            }
        }

        // Auto-compaction runs between turn completion and the next
        // enqueued message.
        maybe_auto_compact(inner).await;

        // Steers first, then follow-ups once the steer queue is dry.
        next = {
            let mut turn = inner.turn.lock().unwrap();
            turn.steer.pop_front().or_else(|| turn.follow_up.pop_front())
        };
    }

    {
        let mut turn = inner.turn.lock().unwrap();
        turn.phase = TurnPhase::Idle;
        turn.cancel = None;
    }
    outcome
}

/// One prompt cycle: append the user message, then stream/execute until an
/// assistant message terminates without tool calls.
async fn run_prompt(
    inner: &Arc<SessionInner>,
    content: UserContent,
    api: &HookApi,
) -> Result<()> {
    let cancel = fresh_cancel(inner);
    set_phase(inner, TurnPhase::Streaming);

    let turn_index = {
        let mut turn = inner.turn.lock().unwrap();
        turn.turn_index += 1;
        turn.turn_index
    };
    inner.events.emit(SessionEvent::TurnStart);
    inner
        .hooks
        .dispatch(&HookEvent::TurnStart { turn_index }, api)
        .await;

    let prompt = Message::User { content };
    inner.append_message(prompt.clone())?;

    // Synthetic pre-messages (plan-mode context and the like) land as
    // hidden custom messages before the stream loop starts.
    for (custom_type, body) in inner.hooks.collect_pre_messages(&prompt, api).await {
        inner.append_custom_message(&custom_type, body, false)?;
    }
    inner.events.emit(SessionEvent::AgentStart);
    inner.hooks.dispatch(&HookEvent::AgentStart, api).await;

    let result = stream_until_done(inner, &cancel, api).await;

    inner.hooks.dispatch(&HookEvent::AgentEnd, api).await;
    inner.events.emit(SessionEvent::AgentEnd);
    inner
        .hooks
        .dispatch(&HookEvent::TurnEnd { turn_index }, api)
        .await;
    inner.events.emit(SessionEvent::TurnEnd);
    result
}

/// The stream loop proper, with retry and tool continuation.
async fn stream_until_done(
    inner: &Arc<SessionInner>,
    cancel: &CancellationToken,
    api: &HookApi,
) -> Result<()> {
    let mut retry = RetryController::new(inner.config.retry.clone());
    // Attempt number whose auto_retry_end is still owed.
    let mut pending_retry: Option<u32> = None;

    loop {
        // Abort observed between suspension points (e.g. during the tool
        // round-trip) finalizes here instead of opening another stream.
        if cancel.is_cancelled() {
            let message = AssistantDraft {
                model: inner.default_model.id.clone(),
                provider: inner.default_model.provider.clone(),
                ..Default::default()
            }
            .into_message(StopReason::Aborted);
            inner.append_message(message)?;
            return Ok(());
        }

        set_phase(inner, TurnPhase::Streaming);
        let built = inner.built_context();
        let messages = inner.hooks.filter_context(built.messages, api).await;
        let model = built.model.unwrap_or_else(|| inner.default_model.clone());

        let mut request = ProviderRequest::new(model.clone(), messages);
        request.tools = inner.tools.definitions();
        request.thinking_level = built.thinking_level;
        request.cancel = cancel.clone();

        let outcome = match inner.provider.stream(request).await {
            Ok(stream) => consume_stream(inner, stream).await,
            // Pre-stream failure: synthesize the errored assistant the
            // stream would have produced.
            Err(error) => {
                let stop_reason = if error.is_cancelled() {
                    StopReason::Aborted
                } else {
                    StopReason::Error
                };
                let draft = AssistantDraft {
                    model: model.id.clone(),
                    provider: model.provider.clone(),
                    error_message: Some(error.to_string()),
                    ..Default::default()
                };
                StreamOutcome::Failed {
                    error,
                    message: draft.into_message(stop_reason),
                }
            }
        };

        match outcome {
            StreamOutcome::Completed { message } => {
                if let Some(attempt) = pending_retry.take() {
                    inner.events.emit(SessionEvent::AutoRetryEnd {
                        success: true,
                        attempt,
                        error: None,
                    });
                }
                retry.reset();

                inner.append_message(message.clone())?;
                if message.tool_uses().is_empty() {
                    return Ok(());
                }

                set_phase(inner, TurnPhase::AwaitingToolResults);
                run_tools(inner, &message, cancel, api).await?;
                // Loop re-enters streaming with the tool outputs on the log;
                // no new user message.
            }
            StreamOutcome::Failed { error, message } => {
                // The errored assistant stays on the log; context building
                // skips it for usage tracking.
                inner.append_message(message)?;

                if let Some(attempt) = pending_retry.take() {
                    inner.events.emit(SessionEvent::AutoRetryEnd {
                        success: false,
                        attempt,
                        error: Some(error.to_string()),
                    });
                }

                if error.is_cancelled() {
                    return Ok(());
                }

                match retry.decide(&error) {
                    RetryDecision::Retry { attempt, delay } => {
                        set_phase(inner, TurnPhase::RetryWait);
                        inner.events.emit(SessionEvent::AutoRetryStart {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                            model: model.clone(),
                        });
                        pending_retry = Some(attempt);
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                inner.events.emit(SessionEvent::AutoRetryEnd {
                                    success: false,
                                    attempt,
                                    error: Some("aborted during retry wait".to_string()),
                                });
                                return Ok(());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::GiveUp => {
                        return Err(error);
                    }
                }
            }
        }
    }
}

// ── Stream consumption ────────────────────────────────────────────────────────

enum StreamOutcome {
    Completed { message: Message },
    Failed { error: AgentError, message: Message },
}

async fn consume_stream(
    inner: &Arc<SessionInner>,
    mut stream: crate::provider::EventStream,
) -> StreamOutcome {
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Start { .. } => {}
            StreamEvent::TextDelta { delta, .. } => {
                inner.events.emit(SessionEvent::TextDelta { delta });
            }
            StreamEvent::ThinkingDelta { delta, .. } => {
                inner.events.emit(SessionEvent::ThinkingDelta { delta });
            }
            StreamEvent::ToolUseStart { id, name, .. } => {
                inner.events.emit(SessionEvent::ToolUseStart {
                    tool_call_id: id,
                    name,
                });
            }
            StreamEvent::ToolUseDelta { .. } => {}
            StreamEvent::UsageDelta { usage } => {
                inner.events.emit(SessionEvent::UsageDelta { usage });
            }
            StreamEvent::Done { message, .. } => {
                return StreamOutcome::Completed { message };
            }
            StreamEvent::Error { error, message } => {
                return StreamOutcome::Failed { error, message };
            }
        }
    }
    // A stream that just stops is a disconnect.
    warn!("provider stream ended without a terminal event");
    StreamOutcome::Failed {
        error: AgentError::provider(
            ProviderErrorKind::Network,
            "stream ended without a terminal event",
        ),
        message: AssistantDraft {
            model: inner.default_model.id.clone(),
            provider: inner.default_model.provider.clone(),
            error_message: Some("stream ended without a terminal event".to_string()),
            ..Default::default()
        }
        .into_message(StopReason::Error),
    }
}

// ── Tool continuation ─────────────────────────────────────────────────────────

async fn run_tools(
    inner: &Arc<SessionInner>,
    assistant: &Message,
    cancel: &CancellationToken,
    api: &HookApi,
) -> Result<()> {
    let calls: Vec<ToolCallRequest> = assistant
        .tool_uses()
        .iter()
        .enumerate()
        .filter_map(|(block_index, block)| match block {
            AssistantBlock::ToolUse { id, name, input } => Some(ToolCallRequest {
                tool_call_id: id.clone(),
                name: name.clone(),
                input: input.clone(),
                block_index,
            }),
            _ => None,
        })
        .collect();

    debug!(count = calls.len(), "dispatching tool calls");
    let options = DispatchOptions {
        timeout: inner.config.tool_timeout,
        sort_by_block_index: inner.config.sort_tool_results_by_block_index,
        context: Some(ToolContext {
            session_id: inner.session_id(),
            cwd: inner.cwd(),
        }),
    };
    for call in &calls {
        inner.events.emit(SessionEvent::ToolExecutionStart {
            tool_call_id: call.tool_call_id.clone(),
            name: call.name.clone(),
        });
    }

    let mut rx = dispatch(
        inner.tools.clone(),
        inner.hooks.clone(),
        api.clone(),
        calls,
        cancel.clone(),
        options,
    );

    // Results append in delivery order; the model associates them by
    // tool_call_id, not position.
    while let Some(outcome) = rx.recv().await {
        if let Some(reason) = &outcome.blocked {
            inner.events.emit(SessionEvent::ToolCallBlocked {
                tool_call_id: outcome.tool_call_id.clone(),
                name: outcome.name.clone(),
                reason: reason.clone(),
            });
        }
        let message = Message::ToolResult {
            tool_call_id: outcome.tool_call_id.clone(),
            content: outcome.result.content.clone(),
            is_error: outcome.result.is_error,
        };
        inner.append_message(message)?;
        inner.events.emit(SessionEvent::ToolExecutionEnd {
            tool_call_id: outcome.tool_call_id.clone(),
            name: outcome.name.clone(),
            is_error: outcome.result.is_error,
        });
        inner
            .hooks
            .dispatch(
                &HookEvent::ToolResult {
                    tool_call_id: outcome.tool_call_id,
                    name: outcome.name,
                    is_error: outcome.result.is_error,
                },
                api,
            )
            .await;
    }

    Ok(())
}

// ── Auto-compaction ───────────────────────────────────────────────────────────

/// Between turn completion and the next queued message: if the last
/// assistant's reported usage crossed the threshold, freeze the branch and
/// compact. Failures are reported, never fatal to the loop.
async fn maybe_auto_compact(inner: &Arc<SessionInner>) {
    if !inner.config.compaction.auto {
        return;
    }
    let usage_total = {
        let log = inner.log.lock().unwrap();
        let path = log.index.current_path(log.store.entries());
        context::last_assistant_usage(&path).map(|(usage, _)| usage.total())
    };
    let Some(total) = usage_total else { return };
    if !compact::over_threshold(total, &inner.config) {
        return;
    }

    set_phase(inner, TurnPhase::Suspended);
    inner.events.emit(SessionEvent::AutoCompactionStart);
    let cancel = CancellationToken::new();
    let success = match compact::run(inner, cancel, false).await {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(error) => {
            warn!(%error, "auto-compaction failed");
            false
        }
    };
    inner.events.emit(SessionEvent::AutoCompactionEnd { success });
}

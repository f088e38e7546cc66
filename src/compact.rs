/// Compaction engine — keeps the working context inside the token budget.
///
/// Threshold detection reads the last assistant's reported usage; cut-point
/// selection walks the path oldest-first and keeps a recent tail within
/// `keep_recent_tokens`, rewinding to a turn boundary when the cut would
/// land inside a multi-assistant turn. The prefix is summarized with a
/// secondary LLM call (or a hook-supplied summary) and recorded as a
/// Compaction entry; the context builder collapses the prefix from then on.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::context;
use crate::entry::SessionEntry;
use crate::error::{AgentError, ProviderErrorKind, Result};
use crate::events::SessionEvent;
use crate::hooks::{BeforeCompactOutcome, HookEvent};
use crate::model::{Message, ModelRef};
use crate::provider::{ProviderRequest, collect_stream};
use crate::session::SessionInner;

pub const SUMMARIZATION_PROMPT: &str = "You summarize coding-agent conversations. Produce a \
concise summary of the transcript that preserves: the user's goals, decisions made, files \
touched and how, commands run and their outcomes, open problems, and anything the agent \
promised to do next. Write plain prose, no preamble.";

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Automatic compaction when the threshold fires. Manual `compact()`
    /// works regardless.
    pub auto: bool,
    /// max_tokens for the summarization call.
    pub summary_max_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            summary_max_tokens: 2048,
        }
    }
}

// ── Threshold ─────────────────────────────────────────────────────────────────

/// True when the reported total crosses `context_window - reserve_tokens`.
pub fn over_threshold(usage_total: u64, config: &SessionConfig) -> bool {
    usage_total > config.context_window.saturating_sub(config.reserve_tokens)
}

/// Cheap token estimate for one entry: serialized length / 4, the same
/// approximation the context budget uses elsewhere.
pub fn estimate_entry_tokens(entry: &SessionEntry) -> u64 {
    let len = serde_json::to_string(entry).map(|s| s.chars().count()).unwrap_or(0);
    (len / 4) as u64 + 10
}

// ── Cut-point selection ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutPoint {
    pub first_kept_entry_id: String,
    pub is_split_turn: bool,
}

/// Earliest entry whose tail fits within `keep_recent_tokens`. Returns None
/// when the whole path already fits (nothing worth collapsing).
pub fn select_cut_point(path: &[&SessionEntry], keep_recent_tokens: u64) -> Option<CutPoint> {
    if path.is_empty() {
        return None;
    }

    let estimates: Vec<u64> = path.iter().map(|e| estimate_entry_tokens(e)).collect();
    let total: u64 = estimates.iter().sum();

    let mut prefix = 0u64;
    let mut cut = path.len() - 1;
    let mut found = false;
    for (i, estimate) in estimates.iter().enumerate() {
        if total - prefix <= keep_recent_tokens {
            cut = i;
            found = true;
            break;
        }
        prefix += estimate;
    }
    // Even the last entry alone exceeds the budget: keep a minimal tail.
    if !found {
        cut = path.len() - 1;
    }
    if cut == 0 {
        return None;
    }

    Some(align_to_turn_boundary(path, cut))
}

/// If the cut falls inside a turn (on an assistant or tool-result entry),
/// rewind to that turn's user message. When no boundary exists after the
/// start, keep the cut and mark the turn split.
fn align_to_turn_boundary(path: &[&SessionEntry], cut: usize) -> CutPoint {
    if is_turn_start(path[cut]) || !is_inside_turn(path[cut]) {
        return CutPoint {
            first_kept_entry_id: path[cut].id().to_string(),
            is_split_turn: false,
        };
    }
    for i in (1..=cut).rev() {
        if is_turn_start(path[i]) {
            return CutPoint {
                first_kept_entry_id: path[i].id().to_string(),
                is_split_turn: false,
            };
        }
    }
    CutPoint {
        first_kept_entry_id: path[cut].id().to_string(),
        is_split_turn: true,
    }
}

fn is_turn_start(entry: &SessionEntry) -> bool {
    matches!(
        entry,
        SessionEntry::Message {
            message: Message::User { .. },
            ..
        } | SessionEntry::CustomMessage { .. }
    )
}

fn is_inside_turn(entry: &SessionEntry) -> bool {
    matches!(
        entry,
        SessionEntry::Message {
            message: Message::Assistant { .. } | Message::ToolResult { .. },
            ..
        }
    )
}

/// Manual compaction with a tail that already fits falls back to the last
/// turn boundary, so the summary covers every completed turn.
pub fn last_turn_boundary(path: &[&SessionEntry]) -> Option<CutPoint> {
    for i in (1..path.len()).rev() {
        if is_turn_start(path[i]) {
            return Some(CutPoint {
                first_kept_entry_id: path[i].id().to_string(),
                is_split_turn: false,
            });
        }
    }
    None
}

// ── Summarization ─────────────────────────────────────────────────────────────

/// Render the prefix as a plain transcript for the summarization call.
fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        match message {
            Message::User { .. } => {
                out.push_str("User:\n");
                out.push_str(&message.text());
            }
            Message::Assistant { .. } => {
                out.push_str("Assistant:\n");
                out.push_str(&message.text());
            }
            Message::ToolResult {
                tool_call_id,
                is_error,
                ..
            } => {
                let tag = if *is_error { "tool error" } else { "tool result" };
                out.push_str(&format!("[{tag} {tool_call_id}]:\n"));
                out.push_str(&message.text());
            }
        }
        out.push_str("\n\n");
    }
    out
}

/// One summarization call against the session's provider. Cancellation
/// aborts cleanly without touching the log.
async fn summarize(
    inner: &Arc<SessionInner>,
    model: &ModelRef,
    prefix_messages: &[Message],
    cancel: CancellationToken,
) -> Result<String> {
    let transcript = render_transcript(prefix_messages);
    let mut request = ProviderRequest::new(
        model.clone(),
        vec![Message::user(format!(
            "Summarize this conversation:\n\n{transcript}"
        ))],
    );
    request.system_prompt = Some(SUMMARIZATION_PROMPT.to_string());
    request.max_tokens = Some(inner.config.compaction.summary_max_tokens);
    request.cancel = cancel;

    let stream = inner.provider.stream(request).await?;
    let message = collect_stream(stream).await?;
    let summary = message.text();
    if summary.trim().is_empty() {
        return Err(AgentError::provider(
            ProviderErrorKind::Server,
            "summarization produced an empty summary",
        ));
    }
    Ok(summary)
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Run one compaction against the current branch. Returns the id of the new
/// Compaction entry, or None when there is nothing to collapse.
///
/// `manual` relaxes cut selection (falls back to the last turn boundary when
/// the tail already fits); automatic runs skip instead.
pub(crate) async fn run(
    inner: &Arc<SessionInner>,
    cancel: CancellationToken,
    manual: bool,
) -> Result<Option<String>> {
    let (path, tokens_before, model) = {
        let log = inner.log.lock().unwrap();
        let path: Vec<SessionEntry> = log
            .index
            .current_path(log.store.entries())
            .into_iter()
            .cloned()
            .collect();
        let path_refs: Vec<&SessionEntry> = path.iter().collect();
        let tokens_before = context::last_assistant_usage(&path_refs)
            .map(|(usage, _)| usage.total())
            .unwrap_or_else(|| path_refs.iter().map(|e| estimate_entry_tokens(e)).sum());
        let model = context::build_context(&path_refs)
            .model
            .unwrap_or_else(|| inner.default_model.clone());
        (path, tokens_before, model)
    };

    let path_refs: Vec<&SessionEntry> = path.iter().collect();
    let cut = match select_cut_point(&path_refs, inner.config.keep_recent_tokens) {
        Some(cut) => cut,
        None if manual => match last_turn_boundary(&path_refs) {
            Some(cut) => cut,
            None => return Ok(None),
        },
        None => {
            debug!("tail already fits, skipping auto-compaction");
            return Ok(None);
        }
    };

    // Hook arbitration: cancel fails the compaction, a supplied summary
    // skips the LLM call entirely.
    let api = inner.hook_api();
    let (summary, from_hook) = match inner.hooks.before_compact(tokens_before, &api).await {
        BeforeCompactOutcome::Cancelled { reason } => {
            return Err(AgentError::CompactionCancelled { reason });
        }
        BeforeCompactOutcome::Summary { summary } => (summary, true),
        BeforeCompactOutcome::Proceed => {
            let cut_index = path
                .iter()
                .position(|e| e.id() == cut.first_kept_entry_id)
                .unwrap_or(path.len());
            let prefix_refs: Vec<&SessionEntry> = path[..cut_index].iter().collect();
            let prefix_messages = context::build_context(&prefix_refs).messages;
            let summary = summarize(inner, &model, &prefix_messages, cancel).await?;
            (summary, false)
        }
    };

    let entry_id = inner.append_compaction(
        &summary,
        Some(&cut.first_kept_entry_id),
        tokens_before,
        cut.is_split_turn,
        from_hook,
    )?;

    info!(entry_id = %entry_id, tokens_before, from_hook, "compaction recorded");
    inner.events.emit(SessionEvent::Compacted {
        entry_id: entry_id.clone(),
        tokens_before,
        from_hook,
    });
    inner
        .hooks
        .dispatch(
            &HookEvent::SessionCompact {
                entry_id: entry_id.clone(),
                from_hook,
            },
            &api,
        )
        .await;

    Ok(Some(entry_id))
}

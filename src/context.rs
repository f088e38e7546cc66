/// Context builder — derives the ordered message list the LLM sees from the
/// path to a leaf.
///
/// Pure over its inputs: the same path always yields the same message list.
/// Compaction entries collapse the prefix before their `first_kept_entry_id`
/// into a single synthetic summary message; label and annotation entries
/// never surface.
use crate::entry::SessionEntry;
use crate::model::{Message, ModelRef, ThinkingLevel, Usage, UserContent};

pub const COMPACTION_SUMMARY_PREFIX: &str =
    "The conversation so far was summarized to stay within the context window:\n\n<summary>\n";
pub const COMPACTION_SUMMARY_SUFFIX: &str = "\n</summary>";
pub const BRANCH_SUMMARY_PREFIX: &str =
    "An earlier line of work was abandoned; its summary:\n\n<branch-summary>\n";
pub const BRANCH_SUMMARY_SUFFIX: &str = "\n</branch-summary>";

/// What the turn engine hands to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    pub thinking_level: ThinkingLevel,
    /// Last model change on the path, or the last assistant's model.
    pub model: Option<ModelRef>,
}

/// Build the LLM-visible context for a path (root first, leaf last).
pub fn build_context(path: &[&SessionEntry]) -> BuiltContext {
    let mut thinking_level = ThinkingLevel::default();
    let mut model_change: Option<ModelRef> = None;
    let mut assistant_model: Option<ModelRef> = None;

    for entry in path {
        match entry {
            SessionEntry::ModelChange {
                provider, model_id, ..
            } => model_change = Some(ModelRef::new(provider.clone(), model_id.clone())),
            SessionEntry::ThinkingLevelChange { thinking_level: level, .. } => {
                thinking_level = *level;
            }
            SessionEntry::Message { message, .. } => {
                if let Message::Assistant {
                    model, provider, ..
                } = message
                {
                    assistant_model = Some(ModelRef::new(provider.clone(), model.clone()));
                }
            }
            _ => {}
        }
    }

    let last_compaction = path
        .iter()
        .rposition(|e| matches!(e, SessionEntry::Compaction { .. }));

    let mut messages = Vec::new();
    match last_compaction {
        Some(compaction_idx) => {
            let compaction = path[compaction_idx];
            if let Some(summary) = compaction_summary_message(compaction) {
                messages.push(summary);
            }
            let kept_start = match compaction {
                SessionEntry::Compaction {
                    first_kept_entry_id: Some(first_kept),
                    ..
                } => path
                    .iter()
                    .position(|e| e.id() == first_kept)
                    .unwrap_or(compaction_idx + 1),
                _ => compaction_idx + 1,
            };
            for entry in &path[kept_start..compaction_idx] {
                if let Some(message) = context_message(entry) {
                    messages.push(message);
                }
            }
            for entry in &path[compaction_idx + 1..] {
                if let Some(message) = context_message(entry) {
                    messages.push(message);
                }
            }
        }
        None => {
            for entry in path {
                if let Some(message) = context_message(entry) {
                    messages.push(message);
                }
            }
        }
    }

    BuiltContext {
        messages,
        thinking_level,
        model: model_change.or(assistant_model),
    }
}

/// The message an entry contributes to the context, if any.
fn context_message(entry: &SessionEntry) -> Option<Message> {
    match entry {
        SessionEntry::Message { message, .. } => Some(message.clone()),
        SessionEntry::CustomMessage { content, .. } => Some(Message::User {
            content: content.clone(),
        }),
        SessionEntry::BranchSummary { summary, .. } => Some(Message::User {
            content: UserContent::Text(format!(
                "{BRANCH_SUMMARY_PREFIX}{summary}{BRANCH_SUMMARY_SUFFIX}"
            )),
        }),
        SessionEntry::ModelChange { .. }
        | SessionEntry::ThinkingLevelChange { .. }
        | SessionEntry::Compaction { .. }
        | SessionEntry::Custom { .. }
        | SessionEntry::Label { .. }
        | SessionEntry::SessionInfo { .. } => None,
    }
}

fn compaction_summary_message(entry: &SessionEntry) -> Option<Message> {
    match entry {
        SessionEntry::Compaction { summary, .. } => Some(Message::User {
            content: UserContent::Text(format!(
                "{COMPACTION_SUMMARY_PREFIX}{summary}{COMPACTION_SUMMARY_SUFFIX}"
            )),
        }),
        _ => None,
    }
}

/// Usage and model of the most recent non-errored assistant on the path.
/// Errored assistants stay in the log but report nothing useful here, so the
/// compaction threshold and retry logic skip them.
pub fn last_assistant_usage(path: &[&SessionEntry]) -> Option<(Usage, ModelRef)> {
    path.iter().rev().find_map(|entry| match entry {
        SessionEntry::Message {
            message:
                Message::Assistant {
                    usage,
                    model,
                    provider,
                    stop_reason,
                    ..
                },
            ..
        } if *stop_reason != crate::model::StopReason::Error => {
            Some((*usage, ModelRef::new(provider.clone(), model.clone())))
        }
        _ => None,
    })
}

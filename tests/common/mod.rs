/// Scripted stub provider for driving the turn engine without a network.
///
/// Each `stream` call pops the next script step. `BlockUntilCancel` parks on
/// the request's cancellation token and finalizes with an aborted assistant,
/// which is how a real stream implementation must answer `abort()`.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use braidcode::error::{AgentError, ProviderErrorKind, Result};
use braidcode::model::{
    AssistantBlock, AssistantDraft, Message, StopReason, Usage,
};
use braidcode::provider::{EventStream, Provider, ProviderRequest, StreamEvent};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum Script {
    /// Stream text deltas then finish with `stop`.
    Text(String),
    /// Like `Text`, with explicit usage on the final assistant.
    TextWithUsage(String, Usage),
    /// Finish with tool_use blocks: (id, name, input).
    ToolCalls(Vec<(String, String, serde_json::Value)>),
    /// Emit a stream error (classified from the message text).
    Error(String),
    /// Park until the cancellation token fires, then yield an aborted
    /// assistant.
    BlockUntilCancel,
}

pub struct StubProvider {
    scripts: Mutex<VecDeque<Script>>,
    pub calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Text(String::new()));

        let cancel = request.cancel.clone();
        let model = request.model.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut draft = AssistantDraft {
                model: model.id.clone(),
                provider: model.provider.clone(),
                ..Default::default()
            };
            let _ = tx.send(StreamEvent::Start {
                partial: draft.clone(),
            });

            let finish_text = |mut draft: AssistantDraft, text: String, usage: Usage| {
                let _ = tx.send(StreamEvent::TextDelta {
                    index: 0,
                    delta: text.clone(),
                });
                draft.content = vec![AssistantBlock::Text { text }];
                draft.usage = usage;
                let _ = tx.send(StreamEvent::UsageDelta { usage });
                let _ = tx.send(StreamEvent::Done {
                    stop_reason: StopReason::Stop,
                    message: draft.into_message(StopReason::Stop),
                });
            };

            match script {
                Script::Text(text) => finish_text(draft, text, Usage::default()),
                Script::TextWithUsage(text, usage) => finish_text(draft, text, usage),
                Script::ToolCalls(calls) => {
                    let mut blocks = Vec::new();
                    for (index, (id, name, input)) in calls.into_iter().enumerate() {
                        let _ = tx.send(StreamEvent::ToolUseStart {
                            index,
                            id: id.clone(),
                            name: name.clone(),
                        });
                        blocks.push(AssistantBlock::ToolUse { id, name, input });
                    }
                    draft.content = blocks;
                    let _ = tx.send(StreamEvent::Done {
                        stop_reason: StopReason::ToolUse,
                        message: draft.into_message(StopReason::ToolUse),
                    });
                }
                Script::Error(text) => {
                    draft.error_message = Some(text.clone());
                    let _ = tx.send(StreamEvent::Error {
                        error: AgentError::provider(
                            ProviderErrorKind::from_message(&text),
                            text,
                        ),
                        message: draft.into_message(StopReason::Error),
                    });
                }
                Script::BlockUntilCancel => {
                    cancel.cancelled().await;
                    let _ = tx.send(StreamEvent::Error {
                        error: AgentError::Cancelled,
                        message: draft.into_message(StopReason::Aborted),
                    });
                }
            }
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
            rx.recv().await.map(|event| (event, rx))
        })))
    }
}

/// Extract the user/assistant messages from a session's log entries.
pub fn message_entries(entries: &[braidcode::SessionEntry]) -> Vec<&Message> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            braidcode::SessionEntry::Message { message, .. } => Some(message),
            _ => None,
        })
        .collect()
}

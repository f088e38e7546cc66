mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use braidcode::{
    AgentError, AgentTool, AgentToolResult, HookBuilder, HookDecision, HookEventKind,
    HookRuntime, Message, ModelRef, RetryConfig, Session, SessionConfig, SessionEntry,
    SessionEvent, StopReason, ToolDefinition, ToolRegistry, UserContent,
};
use common::{Script, StubProvider, message_entries};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

async fn session_with(scripts: Vec<Script>) -> (Session, Arc<StubProvider>) {
    session_with_config(scripts, SessionConfig::default()).await
}

async fn session_with_config(
    scripts: Vec<Script>,
    config: SessionConfig,
) -> (Session, Arc<StubProvider>) {
    let provider = Arc::new(StubProvider::new(scripts));
    let session = Session::builder()
        .provider(provider.clone())
        .model(ModelRef::new("stub", "test-model"))
        .config(config)
        .start_in_memory()
        .await
        .unwrap();
    (session, provider)
}

fn drain_events(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// ── Simple turn ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn simple_turn_appends_user_and_assistant() {
    let (session, _) = session_with(vec![Script::Text("4".to_string())]).await;
    let mut rx = session.subscribe();

    session.prompt("2+2?").await.unwrap();

    let entries = session.entries();
    let messages = message_entries(&entries);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "2+2?");
    assert_eq!(messages[1].text(), "4");
    match messages[1] {
        Message::Assistant { stop_reason, .. } => assert_eq!(*stop_reason, StopReason::Stop),
        other => panic!("expected assistant, got {other:?}"),
    }
    assert_eq!(session.messages().len(), 2);
    assert!(session.is_idle());

    // turn_start … agent_start … deltas … agent_end … turn_end, in order.
    let events = drain_events(&mut rx);
    let preds: [fn(&SessionEvent) -> bool; 5] = [
        |e| matches!(e, SessionEvent::TurnStart),
        |e| matches!(e, SessionEvent::AgentStart),
        |e| matches!(e, SessionEvent::TextDelta { .. }),
        |e| matches!(e, SessionEvent::AgentEnd),
        |e| matches!(e, SessionEvent::TurnEnd),
    ];
    let positions: Vec<usize> = preds
        .iter()
        .map(|pred| events.iter().position(|e| pred(e)).expect("event missing"))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "events out of order");
}

// ── Single flight ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_prompt_while_streaming_is_rejected() {
    let (session, _) =
        session_with(vec![Script::BlockUntilCancel, Script::Text("done".to_string())]).await;

    let mut rx = session.subscribe();
    let background = session.clone();
    let handle = tokio::spawn(async move { background.prompt("A").await });

    // Wait until the turn is actually streaming.
    loop {
        match rx.recv().await.unwrap() {
            SessionEvent::AgentStart => break,
            _ => continue,
        }
    }

    let err = session.prompt("B").await.unwrap_err();
    assert!(matches!(err, AgentError::AlreadyProcessing));

    session.abort();
    handle.await.unwrap().unwrap();
    assert!(session.is_idle());
}

// ── Steering and abort ────────────────────────────────────────────────────────

#[tokio::test]
async fn steer_queues_and_runs_after_abort() {
    let (session, _) = session_with(vec![
        Script::BlockUntilCancel,
        Script::Text("answer to B".to_string()),
    ])
    .await;

    let mut rx = session.subscribe();
    let background = session.clone();
    let handle = tokio::spawn(async move { background.prompt("A").await });

    loop {
        match rx.recv().await.unwrap() {
            SessionEvent::AgentStart => break,
            _ => continue,
        }
    }

    session.steer("B");
    assert_eq!(session.pending_message_count(), 1);

    session.abort();
    handle.await.unwrap().unwrap();

    let entries = session.entries();
    let messages = message_entries(&entries);
    // A, aborted assistant, B, answer to B.
    assert_eq!(messages.len(), 4);
    match messages[1] {
        Message::Assistant { stop_reason, .. } => {
            assert_eq!(*stop_reason, StopReason::Aborted);
        }
        other => panic!("expected aborted assistant, got {other:?}"),
    }
    assert_eq!(messages[2].text(), "B");
    assert_eq!(messages[3].text(), "answer to B");
    assert_eq!(session.pending_message_count(), 0);
}

#[tokio::test]
async fn abort_is_idempotent_and_queues_survive() {
    let (session, _) = session_with(vec![Script::BlockUntilCancel]).await;

    let mut rx = session.subscribe();
    let background = session.clone();
    let handle = tokio::spawn(async move { background.prompt("A").await });
    loop {
        match rx.recv().await.unwrap() {
            SessionEvent::AgentStart => break,
            _ => continue,
        }
    }

    session.follow_up("later");
    session.abort();
    session.abort();
    handle.await.unwrap().unwrap();

    // The follow-up ran as its own turn after idle (stub default response).
    let entries = session.entries();
    let messages = message_entries(&entries);
    assert_eq!(messages[2].text(), "later");
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_error_is_retried_once() {
    let config = SessionConfig {
        retry: RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let (session, provider) = session_with_config(
        vec![
            Script::Error("rate limit".to_string()),
            Script::Text("ok".to_string()),
        ],
        config,
    )
    .await;
    let mut rx = session.subscribe();

    session.prompt("hello").await.unwrap();

    assert_eq!(provider.call_count(), 2);
    let events = drain_events(&mut rx);
    let starts: Vec<&SessionEvent> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::AutoRetryStart { .. }))
        .collect();
    assert_eq!(starts.len(), 1);
    match starts[0] {
        SessionEvent::AutoRetryStart { attempt, .. } => assert_eq!(*attempt, 1),
        _ => unreachable!(),
    }
    let ends: Vec<&SessionEvent> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::AutoRetryEnd { .. }))
        .collect();
    assert_eq!(ends.len(), 1);
    match ends[0] {
        SessionEvent::AutoRetryEnd { success, .. } => assert!(success),
        _ => unreachable!(),
    }

    // The errored assistant stays on the log; the final one is "ok".
    let entries = session.entries();
    let messages = message_entries(&entries);
    assert_eq!(messages.len(), 3);
    assert!(messages[1].is_errored_assistant());
    assert_eq!(messages[2].text(), "ok");
}

#[tokio::test]
async fn exhausted_retries_surface_the_error() {
    let config = SessionConfig {
        retry: RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    };
    let (session, _) = session_with_config(
        vec![
            Script::Error("rate limit".to_string()),
            Script::Error("rate limit".to_string()),
        ],
        config,
    )
    .await;

    let err = session.prompt("hello").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(session.is_idle());
}

#[tokio::test]
async fn permanent_error_is_not_retried() {
    let (session, provider) =
        session_with(vec![Script::Error("invalid api key".to_string())]).await;
    let err = session.prompt("hello").await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(provider.call_count(), 1);
}

// ── Tool round-trips ──────────────────────────────────────────────────────────

struct UppercaseTool;

#[async_trait]
impl AgentTool for UppercaseTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "uppercase".to_string(),
            description: "Uppercase a string".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        }
    }

    async fn execute(
        &self,
        _id: &str,
        params: serde_json::Value,
        _cancel: CancellationToken,
        _context: Option<braidcode::ToolContext>,
    ) -> anyhow::Result<AgentToolResult> {
        let text = params["text"].as_str().unwrap_or_default();
        Ok(AgentToolResult::text(text.to_uppercase()))
    }
}

#[tokio::test]
async fn tool_calls_run_and_the_loop_continues() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(UppercaseTool));

    let provider = Arc::new(StubProvider::new(vec![
        Script::ToolCalls(vec![(
            "call_1".to_string(),
            "uppercase".to_string(),
            serde_json::json!({"text": "hi"}),
        )]),
        Script::Text("shouted".to_string()),
    ]));
    let session = Session::builder()
        .provider(provider.clone())
        .tools(Arc::new(registry))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();
    let mut rx = session.subscribe();

    session.prompt("shout hi").await.unwrap();

    // Two stream calls: tool_use turn, then continuation with results.
    assert_eq!(provider.call_count(), 2);
    let entries = session.entries();
    let messages = message_entries(&entries);
    // user, assistant(tool_use), tool result, final assistant
    assert_eq!(messages.len(), 4);
    match messages[2] {
        Message::ToolResult {
            tool_call_id,
            is_error,
            ..
        } => {
            assert_eq!(tool_call_id, "call_1");
            assert!(!is_error);
            assert_eq!(messages[2].text(), "HI");
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert_eq!(messages[3].text(), "shouted");

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolExecutionStart { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolExecutionEnd { is_error: false, .. })));
}

#[tokio::test]
async fn hook_veto_becomes_error_tool_result() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(UppercaseTool));

    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("no-shouting")
            .on(HookEventKind::ToolCall, |_, _| async {
                Ok(HookDecision::BlockTool {
                    reason: "shouting is rude".to_string(),
                })
            })
            .build(),
    );

    let provider = Arc::new(StubProvider::new(vec![
        Script::ToolCalls(vec![(
            "call_1".to_string(),
            "uppercase".to_string(),
            serde_json::json!({"text": "hi"}),
        )]),
        Script::Text("fine".to_string()),
    ]));
    let session = Session::builder()
        .provider(provider)
        .tools(Arc::new(registry))
        .hooks(Arc::new(hooks))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();
    let mut rx = session.subscribe();

    session.prompt("shout hi").await.unwrap();

    let entries = session.entries();
    let messages = message_entries(&entries);
    match messages[2] {
        Message::ToolResult { is_error, .. } => {
            assert!(is_error);
            assert!(messages[2].text().contains("shouting is rude"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ToolCallBlocked { .. })));
}

// ── Manual compaction ─────────────────────────────────────────────────────────

#[tokio::test]
async fn manual_compaction_splices_a_summary() {
    let (session, _) = session_with(vec![
        Script::Text("r1".to_string()),
        Script::Text("r2".to_string()),
        Script::Text("the story so far".to_string()),
    ])
    .await;
    let mut rx = session.subscribe();

    session.prompt("one").await.unwrap();
    session.prompt("two").await.unwrap();
    let entry_id = session.compact().await.unwrap();

    let entries = session.entries();
    assert!(entries
        .iter()
        .any(|e| matches!(e, SessionEntry::Compaction { id, .. } if *id == entry_id)));

    // Context now starts with the synthetic summary, then the kept tail.
    let messages = session.messages();
    assert!(messages[0].text().contains("the story so far"));
    assert_eq!(messages[1].text(), "two");
    assert_eq!(messages[2].text(), "r2");

    // Manual compaction emits no auto_compaction_* events.
    let events = drain_events(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SessionEvent::AutoCompactionStart | SessionEvent::AutoCompactionEnd { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Compacted { .. })));
}

#[tokio::test]
async fn before_compact_hook_can_cancel() {
    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("refuse")
            .on(HookEventKind::SessionBeforeCompact, |_, _| async {
                Ok(HookDecision::CancelCompaction {
                    reason: "not now".to_string(),
                })
            })
            .build(),
    );
    let provider = Arc::new(StubProvider::new(vec![
        Script::Text("r1".to_string()),
        Script::Text("r2".to_string()),
    ]));
    let session = Session::builder()
        .provider(provider)
        .hooks(Arc::new(hooks))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();

    session.prompt("one").await.unwrap();
    session.prompt("two").await.unwrap();

    let err = session.compact().await.unwrap_err();
    assert!(matches!(err, AgentError::CompactionCancelled { .. }));
}

#[tokio::test]
async fn before_compact_hook_can_supply_summary() {
    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("canned")
            .on(HookEventKind::SessionBeforeCompact, |_, _| async {
                Ok(HookDecision::Summary {
                    summary: "hook-made summary".to_string(),
                })
            })
            .build(),
    );
    let provider = Arc::new(StubProvider::new(vec![
        Script::Text("r1".to_string()),
        Script::Text("r2".to_string()),
    ]));
    let session = Session::builder()
        .provider(provider.clone())
        .hooks(Arc::new(hooks))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();

    session.prompt("one").await.unwrap();
    session.prompt("two").await.unwrap();
    session.compact().await.unwrap();

    // No summarization call went to the provider.
    assert_eq!(provider.call_count(), 2);
    let entries = session.entries();
    match entries.last().unwrap() {
        SessionEntry::Compaction {
            summary, from_hook, ..
        } => {
            assert_eq!(summary, "hook-made summary");
            assert!(from_hook);
        }
        other => panic!("expected compaction entry, got {other:?}"),
    }
}

// ── Auto compaction ───────────────────────────────────────────────────────────

#[tokio::test]
async fn threshold_triggers_auto_compaction_between_turns() {
    let config = SessionConfig {
        context_window: 1_000,
        reserve_tokens: 100,
        keep_recent_tokens: 40,
        ..Default::default()
    };
    let (session, _) = session_with_config(
        vec![
            Script::Text("small".to_string()),
            Script::TextWithUsage(
                "big".to_string(),
                braidcode::Usage {
                    input: 950,
                    output: 10,
                    ..Default::default()
                },
            ),
            Script::Text("summary of everything".to_string()),
        ],
        config,
    )
    .await;
    let mut rx = session.subscribe();

    session.prompt("warm up").await.unwrap();
    session.prompt("do the big thing").await.unwrap();

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::AutoCompactionStart)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::AutoCompactionEnd { success: true })));

    let entries = session.entries();
    assert!(entries
        .iter()
        .any(|e| matches!(e, SessionEntry::Compaction { .. })));
}

// ── Branching ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn branch_moves_leaf_and_prompts_fork() {
    let (session, _) = session_with(vec![
        Script::Text("a1".to_string()),
        Script::Text("a2".to_string()),
        Script::Text("a3".to_string()),
        Script::Text("a2-redo".to_string()),
    ])
    .await;

    session.prompt("u1").await.unwrap();
    session.prompt("u2").await.unwrap();
    session.prompt("u3").await.unwrap();

    let entries = session.entries();
    let u2_id = entries
        .iter()
        .find_map(|e| match e {
            SessionEntry::Message { id, message, .. }
                if message.text() == "u2" && matches!(message, Message::User { .. }) =>
            {
                Some(id.clone())
            }
            _ => None,
        })
        .unwrap();

    session.branch(&u2_id).unwrap();
    assert_eq!(session.leaf(), Some(u2_id.clone()));

    let texts: Vec<String> = session.messages().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["u1", "a1", "u2"]);

    session.prompt("u2 again").await.unwrap();
    // u2 now has two children: the original a2 and the new sibling user
    // message.
    assert_eq!(session.children(&u2_id).len(), 2);
}

#[tokio::test]
async fn branch_with_summary_records_abandoned_tip() {
    let (session, _) = session_with(vec![
        Script::Text("a1".to_string()),
        Script::Text("a2".to_string()),
    ])
    .await;
    session.prompt("u1").await.unwrap();
    session.prompt("u2").await.unwrap();

    let abandoned = session.leaf().unwrap();
    let entries = session.entries();
    let u1_id = entries[0].id().to_string();

    session
        .branch_with_summary(Some(&u1_id), "went down a dead end")
        .unwrap();

    let path = session.path();
    match path.last().unwrap() {
        SessionEntry::BranchSummary { from_id, summary, .. } => {
            assert_eq!(*from_id, abandoned);
            assert_eq!(summary, "went down a dead end");
        }
        other => panic!("expected branch summary, got {other:?}"),
    }
    // The summary surfaces in the rebuilt context.
    assert!(session
        .messages()
        .last()
        .unwrap()
        .text()
        .contains("went down a dead end"));
}

// ── Labels and naming ─────────────────────────────────────────────────────────

#[tokio::test]
async fn label_set_and_clear_round_trip() {
    let (session, _) = session_with(vec![Script::Text("a1".to_string())]).await;
    session.prompt("u1").await.unwrap();

    let target = session.entries()[0].id().to_string();
    session.set_label(&target, Some("checkpoint")).unwrap();
    assert_eq!(session.get_label(&target), Some("checkpoint".to_string()));

    session.set_label(&target, None).unwrap();
    assert_eq!(session.get_label(&target), None);
}

#[tokio::test]
async fn session_name_round_trip() {
    let (session, _) = session_with(vec![]).await;
    assert_eq!(session.name(), None);
    session.set_name(Some("refactor the parser")).unwrap();
    assert_eq!(session.name(), Some("refactor the parser".to_string()));
    session.set_name(None).unwrap();
    assert_eq!(session.name(), None);
}

// ── Hook extras ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn pre_messages_are_appended_hidden() {
    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("plan-mode")
            .on(HookEventKind::BeforeAgentStart, |_, _| async {
                Ok(HookDecision::InjectMessages {
                    messages: vec![(
                        "plan-context".to_string(),
                        UserContent::Text("plan mode is active".to_string()),
                    )],
                })
            })
            .build(),
    );
    let provider = Arc::new(StubProvider::new(vec![Script::Text("ok".to_string())]));
    let session = Session::builder()
        .provider(provider)
        .hooks(Arc::new(hooks))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();

    session.prompt("go").await.unwrap();

    let entries = session.entries();
    let custom = entries
        .iter()
        .find_map(|e| match e {
            SessionEntry::CustomMessage {
                custom_type,
                display,
                ..
            } => Some((custom_type.clone(), *display)),
            _ => None,
        })
        .unwrap();
    assert_eq!(custom.0, "plan-context");
    assert!(!custom.1);

    // Hidden, but in the LLM context.
    assert!(session
        .messages()
        .iter()
        .any(|m| m.text() == "plan mode is active"));
}

#[tokio::test]
async fn context_filter_shapes_the_request() {
    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("redactor")
            .on(HookEventKind::Context, |event, _| async move {
                let braidcode::HookEvent::Context { messages } = event else {
                    return Ok(HookDecision::Continue);
                };
                // Drop everything but the last message.
                let kept = messages.last().cloned().into_iter().collect();
                Ok(HookDecision::ReplaceContext { messages: kept })
            })
            .build(),
    );
    let provider = Arc::new(StubProvider::new(vec![
        Script::Text("r1".to_string()),
        Script::Text("r2".to_string()),
    ]));
    let session = Session::builder()
        .provider(provider)
        .hooks(Arc::new(hooks))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();

    // The filter only affects what the provider sees; the log keeps
    // everything.
    session.prompt("one").await.unwrap();
    session.prompt("two").await.unwrap();
    assert_eq!(session.messages().len(), 4);
}

#[tokio::test]
async fn failing_hook_reports_and_turn_survives() {
    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("broken")
            .on(HookEventKind::AgentStart, |_, _| async {
                anyhow::bail!("hook exploded")
            })
            .build(),
    );
    let provider = Arc::new(StubProvider::new(vec![Script::Text("ok".to_string())]));
    let session = Session::builder()
        .provider(provider)
        .hooks(Arc::new(hooks))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();
    let mut rx = session.subscribe();

    session.prompt("go").await.unwrap();

    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::HookError { hook, .. } if hook == "broken")));
    assert_eq!(session.messages().len(), 2);
}

struct PickSecond;

#[async_trait]
impl braidcode::UiBridge for PickSecond {
    async fn choose(&self, _prompt: &str, options: &[String]) -> Option<usize> {
        (options.len() > 1).then_some(1)
    }
}

#[tokio::test]
async fn hooks_can_prompt_choices_through_the_ui_bridge() {
    let mut hooks = HookRuntime::new();
    hooks.install(
        HookBuilder::new("chooser")
            .on(HookEventKind::AgentStart, |_, api| async move {
                let picked = api
                    .choose("which way?", &["left".to_string(), "right".to_string()])
                    .await;
                api.append_entry("route-choice", Some(serde_json::json!({"picked": picked})))?;
                Ok(HookDecision::Continue)
            })
            .build(),
    );
    let provider = Arc::new(StubProvider::new(vec![Script::Text("ok".to_string())]));
    let session = Session::builder()
        .provider(provider)
        .hooks(Arc::new(hooks))
        .ui(Arc::new(PickSecond))
        .model(ModelRef::new("stub", "test-model"))
        .start_in_memory()
        .await
        .unwrap();

    session.prompt("go").await.unwrap();

    let entries = session.entries();
    let data = entries
        .iter()
        .find_map(|e| match e {
            SessionEntry::Custom {
                custom_type, data, ..
            } if custom_type == "route-choice" => data.clone(),
            _ => None,
        })
        .unwrap();
    assert_eq!(data["picked"], 1);
    // Custom entries never enter the LLM context.
    assert_eq!(session.messages().len(), 2);
}

// ── Misc façade behavior ──────────────────────────────────────────────────────

#[tokio::test]
async fn rewind_leaf_skips_trailing_errored_assistant() {
    let (session, _) = session_with(vec![Script::Error("invalid api key".to_string())]).await;
    let _ = session.prompt("hello").await;

    let before = session.path().len();
    assert!(session.rewind_leaf_if_error());
    assert_eq!(session.path().len(), before - 1);
    assert!(!session.rewind_leaf_if_error());
}

#[tokio::test]
async fn model_and_thinking_changes_are_recorded_inline() {
    let (session, _) = session_with(vec![Script::Text("ok".to_string())]).await;
    session
        .set_model(&ModelRef::new("stub", "bigger-model"))
        .unwrap();
    session
        .set_thinking_level(braidcode::ThinkingLevel::High)
        .unwrap();
    session.prompt("go").await.unwrap();

    let built = session.built_context();
    assert_eq!(built.model, Some(ModelRef::new("stub", "bigger-model")));
    assert_eq!(built.thinking_level, braidcode::ThinkingLevel::High);
}

#[tokio::test]
async fn take_queued_drains_pending_messages() {
    let (session, _) = session_with(vec![]).await;
    session.steer("a");
    session.follow_up("b");
    assert_eq!(session.pending_message_count(), 2);
    let drained = session.take_queued();
    assert_eq!(drained.len(), 2);
    assert_eq!(session.pending_message_count(), 0);
    assert!(matches!(&drained[0], UserContent::Text(t) if t == "a"));
}

/// Session façade — the one contract frontends drive.
///
/// A session owns an append-only log plus its branch index (one lock
/// region), the turn engine's queue state (a second lock region), and the
/// fan-out event bus. `prompt` runs the agent loop to completion; `steer` /
/// `follow_up` enqueue; `abort` cancels cooperatively; `branch` moves the
/// leaf; `compact` collapses the prefix. All mutations serialize through
/// session operations — hooks never touch the log directly.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{SessionConfig, session_dir_for_cwd};
use crate::context::{self, BuiltContext};
use crate::entry::{SessionEntry, SessionHeader, now_iso};
use crate::error::{AgentError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::hooks::{CommandSpec, HookApi, HookEvent, HookRuntime, UiBridge};
use crate::index::{BranchIndex, TreeNode};
use crate::model::{Message, ModelRef, ThinkingLevel, UserContent};
use crate::provider::Provider;
use crate::store::{LogStore, most_recent_session, session_file_name};
use crate::tools::ToolRegistry;
use crate::compact;
use crate::turn::{self, TurnPhase, TurnState};

// ── Shared state ──────────────────────────────────────────────────────────────

/// The log store and its index share one mutual-exclusion region: every
/// mutation of entries, by-id map, leaf, or labels serializes here.
pub(crate) struct LogState {
    pub store: LogStore,
    pub index: BranchIndex,
}

impl LogState {
    /// Append an entry built from a fresh id, the current leaf as parent,
    /// and a now-timestamp. Moves the leaf onto the new entry.
    fn append_with(
        &mut self,
        build: impl FnOnce(String, Option<String>, String) -> SessionEntry,
    ) -> Result<String> {
        let id = self.index.next_id();
        let parent = self.index.leaf().map(str::to_string);
        let entry = build(id.clone(), parent, now_iso());
        let position = self.store.entries().len();
        self.store.append(entry.clone())?;
        self.index.record(&entry, position);
        Ok(id)
    }
}

pub(crate) struct SessionInner {
    pub log: Mutex<LogState>,
    pub turn: Mutex<TurnState>,
    pub events: EventBus,
    pub hooks: Arc<HookRuntime>,
    pub provider: Arc<dyn Provider>,
    pub tools: Arc<ToolRegistry>,
    pub config: SessionConfig,
    pub default_model: ModelRef,
    /// Model registry exposed to hooks, loaded at construction.
    pub models: Vec<ModelRef>,
    /// Optional frontend bridge for choice prompts.
    pub ui: Option<Arc<dyn UiBridge>>,
}

impl SessionInner {
    pub(crate) fn hook_api(self: &Arc<Self>) -> HookApi {
        HookApi::new(Arc::downgrade(self))
    }

    pub(crate) fn session_id(&self) -> String {
        self.log.lock().unwrap().store.header().id.clone()
    }

    pub(crate) fn cwd(&self) -> String {
        self.log.lock().unwrap().store.header().cwd.clone()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.turn.lock().unwrap().phase == TurnPhase::Idle
    }

    pub(crate) fn built_context(&self) -> BuiltContext {
        let log = self.log.lock().unwrap();
        let path = log.index.current_path(log.store.entries());
        context::build_context(&path)
    }

    pub(crate) fn current_model(&self) -> Option<ModelRef> {
        self.built_context().model
    }

    pub(crate) fn entries_snapshot(&self) -> Vec<SessionEntry> {
        self.log.lock().unwrap().store.entries().to_vec()
    }

    pub(crate) fn append_message(&self, message: Message) -> Result<String> {
        let entry_id = {
            let mut log = self.log.lock().unwrap();
            log.append_with(|id, parent_id, timestamp| SessionEntry::Message {
                id,
                parent_id,
                timestamp,
                message: message.clone(),
            })?
        };
        self.events.emit(SessionEvent::MessageAppended {
            entry_id: entry_id.clone(),
            message,
        });
        Ok(entry_id)
    }

    pub(crate) fn append_custom_message(
        &self,
        custom_type: &str,
        content: UserContent,
        display: bool,
    ) -> Result<String> {
        let mut log = self.log.lock().unwrap();
        log.append_with(|id, parent_id, timestamp| SessionEntry::CustomMessage {
            id,
            parent_id,
            timestamp,
            custom_type: custom_type.to_string(),
            content: content.clone(),
            display,
        })
    }

    pub(crate) fn append_custom(
        &self,
        custom_type: &str,
        data: Option<serde_json::Value>,
    ) -> Result<String> {
        let mut log = self.log.lock().unwrap();
        log.append_with(|id, parent_id, timestamp| SessionEntry::Custom {
            id,
            parent_id,
            timestamp,
            custom_type: custom_type.to_string(),
            data: data.clone(),
        })
    }

    pub(crate) fn append_compaction(
        &self,
        summary: &str,
        first_kept_entry_id: Option<&str>,
        tokens_before: u64,
        is_split_turn: bool,
        from_hook: bool,
    ) -> Result<String> {
        let mut log = self.log.lock().unwrap();
        if let Some(first_kept) = first_kept_entry_id {
            if !log.index.contains(first_kept) {
                return Err(AgentError::UnknownEntry(first_kept.to_string()));
            }
        }
        log.append_with(|id, parent_id, timestamp| SessionEntry::Compaction {
            id,
            parent_id,
            timestamp,
            summary: summary.to_string(),
            first_kept_entry_id: first_kept_entry_id.map(str::to_string),
            tokens_before,
            is_split_turn,
            from_hook,
        })
    }

    pub(crate) fn set_active_tools(&self, names: Option<Vec<String>>) {
        self.tools.set_active(names);
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct SessionBuilder {
    provider: Option<Arc<dyn Provider>>,
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRuntime>,
    config: SessionConfig,
    default_model: Option<ModelRef>,
    models: Vec<ModelRef>,
    ui: Option<Arc<dyn UiBridge>>,
    /// Overrides the per-cwd session directory (tests, embedders).
    session_dir: Option<PathBuf>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: Arc::new(ToolRegistry::new()),
            hooks: Arc::new(HookRuntime::new()),
            config: SessionConfig::default(),
            default_model: None,
            models: Vec::new(),
            ui: None,
            session_dir: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookRuntime>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn model(mut self, model: ModelRef) -> Self {
        self.default_model = Some(model);
        self
    }

    pub fn models(mut self, models: Vec<ModelRef>) -> Self {
        self.models = models;
        self
    }

    pub fn ui(mut self, bridge: Arc<dyn UiBridge>) -> Self {
        self.ui = Some(bridge);
        self
    }

    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    /// New persistent session for the current working directory. The file
    /// is created lazily, on the first appended entry.
    pub async fn start(self) -> Result<Session> {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.start_in(cwd).await
    }

    /// New persistent session for an explicit working directory.
    pub async fn start_in(self, cwd: impl Into<String>) -> Result<Session> {
        let cwd = cwd.into();
        let header = SessionHeader::new(uuid::Uuid::new_v4().to_string(), cwd.clone());
        let dir = self
            .session_dir
            .clone()
            .unwrap_or_else(|| session_dir_for_cwd(&cwd));
        let path = dir.join(session_file_name(&header.timestamp, &header.id));
        let store = LogStore::persistent(header, path);
        self.finish(store).await
    }

    /// New in-memory session; nothing touches disk.
    pub async fn start_in_memory(self) -> Result<Session> {
        let cwd = std::env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let header = SessionHeader::new(uuid::Uuid::new_v4().to_string(), cwd);
        let store = LogStore::in_memory(header);
        self.finish(store).await
    }

    /// Open an existing session file: parse, migrate, rebuild the index.
    pub async fn open(self, path: &Path) -> Result<Session> {
        let store = LogStore::open(path)?;
        self.finish(store).await
    }

    /// Resume the most recently modified valid session for a cwd.
    pub async fn continue_recent(self, cwd: &str) -> Result<Session> {
        let dir = self
            .session_dir
            .clone()
            .unwrap_or_else(|| session_dir_for_cwd(cwd));
        match most_recent_session(&dir)? {
            Some(path) => self.open(&path).await,
            None => Err(AgentError::NoRecentSession(dir.display().to_string())),
        }
    }

    async fn finish(self, store: LogStore) -> Result<Session> {
        let provider = self
            .provider
            .ok_or(AgentError::BuilderIncomplete("a provider"))?;
        let default_model = self
            .default_model
            .ok_or(AgentError::BuilderIncomplete("a model"))?;

        let index = BranchIndex::rebuild(store.entries());
        let inner = Arc::new(SessionInner {
            log: Mutex::new(LogState { store, index }),
            turn: Mutex::new(TurnState::default()),
            events: EventBus::new(),
            hooks: self.hooks,
            provider,
            tools: self.tools,
            config: self.config,
            default_model,
            models: self.models,
            ui: self.ui,
        });

        let session = Session { inner };
        let session_id = session.id();
        info!(session_id = %session_id, "session ready");
        session.inner.events.emit(SessionEvent::SessionStart {
            session_id: session_id.clone(),
        });
        let api = session.inner.hook_api();
        session
            .inner
            .hooks
            .dispatch(&HookEvent::SessionStart { session_id }, &api)
            .await;
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Cloning shares the session: clones see the same log, queues, and
/// subscribers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id()).finish()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn id(&self) -> String {
        self.inner.session_id()
    }

    pub fn cwd(&self) -> String {
        self.inner.cwd()
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.inner
            .log
            .lock()
            .unwrap()
            .store
            .path()
            .map(Path::to_path_buf)
    }

    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Subscribe to the session's event stream. Events arrive in emission
    /// order; every subscriber sees the same sequence.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ── Turn operations ───────────────────────────────────────────────────

    /// Run one agent loop: append the user message, stream, execute tools,
    /// deliver queued steers, return at idle. A second prompt while the
    /// loop runs yields `AlreadyProcessing`.
    pub async fn prompt(&self, content: impl Into<UserContent>) -> Result<()> {
        {
            let mut turn = self.inner.turn.lock().unwrap();
            if turn.phase != TurnPhase::Idle {
                return Err(AgentError::AlreadyProcessing);
            }
            // Reserve the flight slot before the first await point.
            turn.phase = TurnPhase::Streaming;
        }
        turn::run_agent(&self.inner, content.into()).await
    }

    /// Queue a message to be fed as the next turn. The current turn keeps
    /// streaming; steers deliver FIFO. Never errors.
    pub fn steer(&self, content: impl Into<UserContent>) {
        self.inner
            .turn
            .lock()
            .unwrap()
            .steer
            .push_back(content.into());
    }

    /// Queue a message for after the loop next reaches idle; unlike steers
    /// it does not extend the running loop ahead of them.
    pub fn follow_up(&self, content: impl Into<UserContent>) {
        self.inner
            .turn
            .lock()
            .unwrap()
            .follow_up
            .push_back(content.into());
    }

    /// Messages queued but not yet delivered.
    pub fn pending_message_count(&self) -> usize {
        self.inner.turn.lock().unwrap().pending_count()
    }

    /// Drain the steer and follow-up queues, returning what was queued.
    pub fn take_queued(&self) -> Vec<UserContent> {
        let mut turn = self.inner.turn.lock().unwrap();
        let mut out: Vec<UserContent> = turn.steer.drain(..).collect();
        out.extend(turn.follow_up.drain(..));
        out
    }

    /// Cancel the in-flight turn. Idempotent and non-blocking; the stream
    /// finalizes with an aborted assistant, pending tools with error
    /// results. Queued steers stay queued unless also drained.
    pub fn abort(&self) {
        if let Some(cancel) = &self.inner.turn.lock().unwrap().cancel {
            cancel.cancel();
        }
    }

    // ── Compaction ────────────────────────────────────────────────────────

    /// Run the compaction engine once, synchronously. Does not emit the
    /// auto-compaction events.
    pub async fn compact(&self) -> Result<String> {
        {
            let mut turn = self.inner.turn.lock().unwrap();
            if turn.phase != TurnPhase::Idle {
                return Err(AgentError::AlreadyProcessing);
            }
            turn.phase = TurnPhase::Suspended;
        }
        let cancel = CancellationToken::new();
        let result = compact::run(&self.inner, cancel, true).await;
        {
            let mut turn = self.inner.turn.lock().unwrap();
            turn.phase = TurnPhase::Idle;
        }
        result?.ok_or(AgentError::NothingToCompact)
    }

    // ── Branching ─────────────────────────────────────────────────────────

    /// Move the leaf to an existing entry without appending. A subsequent
    /// prompt extends a sibling path.
    pub fn branch(&self, entry_id: &str) -> Result<()> {
        if !self.is_idle() {
            return Err(AgentError::AlreadyProcessing);
        }
        self.inner.log.lock().unwrap().index.branch_to(entry_id)
    }

    /// Abandon the current branch: move the leaf to `to` (or the root when
    /// None) and record a BranchSummary for the abandoned tip on the
    /// surviving branch.
    pub fn branch_with_summary(&self, to: Option<&str>, summary: &str) -> Result<String> {
        if !self.is_idle() {
            return Err(AgentError::AlreadyProcessing);
        }
        let mut log = self.inner.log.lock().unwrap();
        let abandoned = log.index.leaf().map(str::to_string);
        match to {
            Some(id) => log.index.branch_to(id)?,
            None => log.index.reset_leaf(),
        }
        log.append_with(|id, parent_id, timestamp| SessionEntry::BranchSummary {
            id,
            parent_id,
            timestamp,
            from_id: abandoned.clone().unwrap_or_else(|| "root".to_string()),
            summary: summary.to_string(),
        })
    }

    /// Copy the ancestral path of `leaf_id` into a new session file,
    /// recording this session as its parent. Label entries are dropped from
    /// the copy; labels whose targets lie on the path are reappended.
    pub async fn branched_session(&self, leaf_id: &str) -> Result<Session> {
        let (cwd, parent_session, copied, labels) = {
            let log = self.inner.log.lock().unwrap();
            if !log.index.contains(leaf_id) {
                return Err(AgentError::UnknownEntry(leaf_id.to_string()));
            }
            let path_entries = log.index.path_to(log.store.entries(), Some(leaf_id));
            let path_ids: HashSet<String> =
                path_entries.iter().map(|e| e.id().to_string()).collect();

            // Drop label entries and re-link the parent chain across the
            // holes they leave.
            let mut copied: Vec<SessionEntry> = Vec::new();
            let mut last_kept: Option<String> = None;
            for entry in &path_entries {
                if matches!(entry, SessionEntry::Label { .. }) {
                    continue;
                }
                let mut cloned = (*entry).clone();
                cloned.set_identity(cloned.id().to_string(), last_kept.clone());
                last_kept = Some(cloned.id().to_string());
                copied.push(cloned);
            }

            let labels: Vec<(String, String)> = log
                .index
                .labels()
                .iter()
                .filter(|(target, _)| path_ids.contains(*target))
                .map(|(target, label)| (target.clone(), label.clone()))
                .collect();

            let parent_session = log
                .store
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| log.store.header().id.clone());
            (log.store.header().cwd.clone(), parent_session, copied, labels)
        };

        let mut header = SessionHeader::new(uuid::Uuid::new_v4().to_string(), cwd);
        header.parent_session = Some(parent_session);

        let store = match self.file_path() {
            Some(current) => {
                let dir = current.parent().map(Path::to_path_buf).unwrap_or_default();
                let path = dir.join(session_file_name(&header.timestamp, &header.id));
                LogStore::persistent(header, path)
            }
            None => LogStore::in_memory(header),
        };

        let mut log = LogState {
            store,
            index: BranchIndex::new(),
        };
        for entry in copied {
            let position = log.store.entries().len();
            log.store.append(entry.clone())?;
            log.index.record(&entry, position);
        }
        let copied_leaf = log.index.leaf().map(str::to_string);
        for (target, label) in labels {
            log.append_with(|id, parent_id, timestamp| SessionEntry::Label {
                id,
                parent_id,
                timestamp,
                target_id: target.clone(),
                label: Some(label.clone()),
            })?;
        }
        // The branch tip is the copied leaf, not the trailing label entries.
        // (The requested leaf may itself have been a dropped label entry.)
        let new_leaf = if log.index.contains(leaf_id) {
            Some(leaf_id.to_string())
        } else {
            copied_leaf
        };
        log.index.set_leaf(new_leaf);

        let inner = Arc::new(SessionInner {
            log: Mutex::new(log),
            turn: Mutex::new(TurnState::default()),
            events: EventBus::new(),
            hooks: self.inner.hooks.clone(),
            provider: self.inner.provider.clone(),
            tools: self.inner.tools.clone(),
            config: self.inner.config.clone(),
            default_model: self.inner.default_model.clone(),
            models: self.inner.models.clone(),
            ui: self.inner.ui.clone(),
        });
        let session = Session { inner };
        let api = session.inner.hook_api();
        let session_id = session.id();
        session.inner.events.emit(SessionEvent::SessionStart {
            session_id: session_id.clone(),
        });
        session
            .inner
            .hooks
            .dispatch(&HookEvent::SessionStart { session_id }, &api)
            .await;
        Ok(session)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn leaf(&self) -> Option<String> {
        self.inner.log.lock().unwrap().index.leaf().map(str::to_string)
    }

    pub fn entry(&self, entry_id: &str) -> Option<SessionEntry> {
        let log = self.inner.log.lock().unwrap();
        log.index.entry(log.store.entries(), entry_id).cloned()
    }

    pub fn entries(&self) -> Vec<SessionEntry> {
        self.inner.entries_snapshot()
    }

    /// Entries on the current branch, root first.
    pub fn path(&self) -> Vec<SessionEntry> {
        let log = self.inner.log.lock().unwrap();
        log.index
            .current_path(log.store.entries())
            .into_iter()
            .cloned()
            .collect()
    }

    /// The LLM-visible messages at the current leaf.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.built_context().messages
    }

    pub fn built_context(&self) -> BuiltContext {
        self.inner.built_context()
    }

    pub fn tree(&self) -> Vec<TreeNode> {
        let log = self.inner.log.lock().unwrap();
        log.index.tree(log.store.entries())
    }

    pub fn children(&self, entry_id: &str) -> Vec<String> {
        self.inner
            .log
            .lock()
            .unwrap()
            .index
            .children(entry_id)
            .to_vec()
    }

    /// Commands contributed by installed hooks.
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.inner.hooks.commands()
    }

    // ── Labels / annotations ──────────────────────────────────────────────

    /// Set or clear (None) a label on an entry.
    pub fn set_label(&self, target_id: &str, label: Option<&str>) -> Result<String> {
        let mut log = self.inner.log.lock().unwrap();
        if !log.index.contains(target_id) {
            return Err(AgentError::UnknownEntry(target_id.to_string()));
        }
        log.append_with(|id, parent_id, timestamp| SessionEntry::Label {
            id,
            parent_id,
            timestamp,
            target_id: target_id.to_string(),
            label: label.map(str::to_string),
        })
    }

    pub fn get_label(&self, target_id: &str) -> Option<String> {
        self.inner
            .log
            .lock()
            .unwrap()
            .index
            .label(target_id)
            .map(str::to_string)
    }

    /// Name the session (a SessionInfo entry; None clears).
    pub fn set_name(&self, name: Option<&str>) -> Result<String> {
        let mut log = self.inner.log.lock().unwrap();
        log.append_with(|id, parent_id, timestamp| SessionEntry::SessionInfo {
            id,
            parent_id,
            timestamp,
            name: name.map(str::to_string),
        })
    }

    pub fn name(&self) -> Option<String> {
        let log = self.inner.log.lock().unwrap();
        log.store
            .entries()
            .iter()
            .rev()
            .find_map(|entry| match entry {
                SessionEntry::SessionInfo { name, .. } => Some(name.clone()),
                _ => None,
            })
            .flatten()
    }

    // ── Configuration changes ─────────────────────────────────────────────

    /// Record a model switch in-line so the context at any leaf is
    /// reproducible.
    pub fn set_model(&self, model: &ModelRef) -> Result<String> {
        if !self.is_idle() {
            return Err(AgentError::AlreadyProcessing);
        }
        let mut log = self.inner.log.lock().unwrap();
        log.append_with(|id, parent_id, timestamp| SessionEntry::ModelChange {
            id,
            parent_id,
            timestamp,
            provider: model.provider.clone(),
            model_id: model.id.clone(),
        })
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) -> Result<String> {
        if !self.is_idle() {
            return Err(AgentError::AlreadyProcessing);
        }
        let mut log = self.inner.log.lock().unwrap();
        log.append_with(|id, parent_id, timestamp| SessionEntry::ThinkingLevelChange {
            id,
            parent_id,
            timestamp,
            thinking_level: level,
        })
    }

    /// After a failed turn, rewind the leaf past a trailing errored
    /// assistant so a retry prompt does not fork a branch. Returns whether
    /// anything moved.
    pub fn rewind_leaf_if_error(&self) -> bool {
        let mut log = self.inner.log.lock().unwrap();
        let Some(leaf_id) = log.index.leaf().map(str::to_string) else {
            return false;
        };
        let parent = match log.index.entry(log.store.entries(), &leaf_id) {
            Some(entry) if entry.is_errored_assistant() => {
                entry.parent_id().map(str::to_string)
            }
            _ => return false,
        };
        log.index.set_leaf(parent);
        true
    }
}

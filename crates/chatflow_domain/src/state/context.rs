use super::{ContextId, MAX_LOG_ENTRIES_IN_MEMORY};
use crate::RunConfig;

#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    UserPrompt { text: String },
    AssistantReply { text: String },
    ToolEvent { data: serde_json::Value },
    Info { message: String },
    Warning { message: String },
    Error { message: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueuedAction {
    pub prompt_text: String,
    pub config: RunConfig,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DispatchOrigin {
    User,
    Workflow,
    Queued,
    Relay,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActiveDispatch {
    pub id: u64,
    pub origin: DispatchOrigin,
}

#[derive(Clone, Debug)]
pub struct ChatContext {
    pub id: ContextId,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub active_connections: Vec<String>,
    /// Set while a workflow-driven dispatch targets this context.
    pub activity: bool,
    /// Whether the UI surface accepts input.
    pub ready: bool,
    pub assigned_config: Option<RunConfig>,
    pub queued_action: Option<QueuedAction>,
    pub entries: Vec<LogEntry>,
    active_dispatch: Option<ActiveDispatch>,
    next_dispatch_id: u64,
}

impl ChatContext {
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            conversation_id: None,
            title: None,
            active_connections: Vec::new(),
            activity: false,
            ready: true,
            assigned_config: None,
            queued_action: None,
            entries: Vec::new(),
            active_dispatch: None,
            next_dispatch_id: 1,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active_dispatch.is_some()
    }

    pub fn active_dispatch(&self) -> Option<ActiveDispatch> {
        self.active_dispatch
    }

    pub(crate) fn begin_dispatch(&mut self, origin: DispatchOrigin) -> Option<u64> {
        if self.active_dispatch.is_some() {
            return None;
        }
        let id = self.next_dispatch_id;
        self.next_dispatch_id = self.next_dispatch_id.saturating_add(1);
        self.active_dispatch = Some(ActiveDispatch { id, origin });
        Some(id)
    }

    /// Clears the busy flag if `dispatch_id` is the outstanding dispatch.
    pub(crate) fn finish_dispatch(&mut self, dispatch_id: u64) -> Option<ActiveDispatch> {
        match self.active_dispatch {
            Some(active) if active.id == dispatch_id => self.active_dispatch.take(),
            _ => None,
        }
    }

    pub(crate) fn is_current_dispatch(&self, dispatch_id: u64) -> bool {
        self.active_dispatch.is_some_and(|active| active.id == dispatch_id)
    }

    pub(crate) fn push_entry(&mut self, entry: LogEntry) {
        self.entries.push(entry);
        if self.entries.len() > MAX_LOG_ENTRIES_IN_MEMORY {
            let overflow = self.entries.len() - MAX_LOG_ENTRIES_IN_MEMORY;
            self.entries.drain(0..overflow);
        }
    }

    pub(crate) fn reset_conversation(&mut self) {
        self.conversation_id = None;
        self.title = None;
        self.active_connections.clear();
        self.assigned_config = None;
        self.queued_action = None;
        self.activity = false;
        self.entries.clear();
    }
}

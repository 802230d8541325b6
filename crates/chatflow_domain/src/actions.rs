use crate::{ConfigFallback, ContextId, PersistedModes, QueuedAction, RunConfig};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchReply {
    pub text: String,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub active_connections: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchFailure {
    /// The stream broke or ended without a terminal event.
    Transport(String),
    /// The backend answered with an `error` event.
    Backend(String),
    /// A frame could not be decoded.
    Malformed(String),
    TargetNotReady,
}

impl std::fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchFailure::Transport(message) => write!(f, "transport error: {message}"),
            DispatchFailure::Backend(message) => write!(f, "backend error: {message}"),
            DispatchFailure::Malformed(message) => write!(f, "malformed response: {message}"),
            DispatchFailure::TargetNotReady => {
                f.write_str("target chat surface did not become ready")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Action {
    AppStarted,

    ModesLoaded {
        persisted: PersistedModes,
    },
    ModesLoadFailed {
        message: String,
    },
    ModesSaved,
    ModesSaveFailed {
        message: String,
    },

    OpenContext {
        context_id: Option<ContextId>,
    },
    CloseContext {
        context_id: ContextId,
    },
    SurfaceReady {
        context_id: ContextId,
    },
    SubmitPrompt {
        context_id: ContextId,
        text: String,
    },
    ResetContext {
        context_id: ContextId,
    },

    SetWorkflowEnabled {
        enabled: bool,
    },
    SetRelayEnabled {
        enabled: bool,
    },
    ReloadCatalog,

    DispatchLog {
        context_id: ContextId,
        dispatch_id: u64,
        data: serde_json::Value,
    },
    DispatchSucceeded {
        context_id: ContextId,
        dispatch_id: u64,
        reply: DispatchReply,
    },
    DispatchFailed {
        context_id: ContextId,
        dispatch_id: u64,
        failure: DispatchFailure,
    },

    SurfaceSwitchTimedOut {
        transition_id: u64,
    },
    ContextConfigured {
        transition_id: u64,
        applied: RunConfig,
        fallbacks: Vec<ConfigFallback>,
    },
    ContextConfigureFailed {
        transition_id: u64,
        partial: Option<RunConfig>,
        message: String,
    },
    DeliverTransition {
        transition_id: u64,
    },

    QueuedActionDue {
        context_id: ContextId,
        action: QueuedAction,
    },
    RelayDue {
        target: ContextId,
        text: String,
    },
    AutoCloseDue {
        context_id: ContextId,
    },
}

use crate::{ContextId, QueuedAction, RunConfig};

/// Everything the backend needs to run one prompt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DispatchPlan {
    pub prompt: String,
    pub model_id: String,
    pub preset_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug)]
pub enum Effect {
    LoadModes,
    SaveModes,
    LoadCatalog,

    StartDispatch {
        context_id: ContextId,
        dispatch_id: u64,
        plan: DispatchPlan,
    },

    /// Bring `context_id` to the front. With a transition id, the engine
    /// reports back if the UI does not confirm in time.
    ShowSurface {
        context_id: ContextId,
        transition_id: Option<u64>,
    },
    ConfigureContext {
        transition_id: u64,
        context_id: ContextId,
        config: RunConfig,
    },
    RetryDelivery {
        transition_id: u64,
    },
    DrainQueuedAction {
        context_id: ContextId,
        action: QueuedAction,
    },
    ScheduleRelay {
        target: ContextId,
        text: String,
    },
    ScheduleAutoClose {
        context_id: ContextId,
    },

    SurfaceOpened {
        context_id: ContextId,
    },
    SurfaceClosed {
        context_id: ContextId,
    },
}

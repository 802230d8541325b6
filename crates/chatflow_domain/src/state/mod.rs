mod app;
mod context;
mod ids;
mod persisted;
mod registry;

pub use app::{AppState, EngineSettings, Modes, RelayState, WorkflowLayout};
pub use context::{ActiveDispatch, ChatContext, DispatchOrigin, LogEntry, QueuedAction};
pub use ids::ContextId;
pub use persisted::PersistedModes;
pub use registry::{RegistryError, SessionRegistry};

pub(crate) const MAX_LOG_ENTRIES_IN_MEMORY: usize = 5000;

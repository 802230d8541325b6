use super::{ChatContext, ContextId, SessionRegistry};
use crate::{PatternMatcher, RegexPatternRegistry, WorkflowTransition};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WorkflowLayout {
    /// One persistent context per workflow rule target.
    #[default]
    Tabs,
    /// A fresh context per transition; the source closes afterwards.
    Windows,
}

impl WorkflowLayout {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tabs => "tabs",
            Self::Windows => "windows",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tabs" | "tab" => Some(Self::Tabs),
            "windows" | "window" => Some(Self::Windows),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineSettings {
    pub layout: WorkflowLayout,
    /// Surfaces opened by the workflow only accept prompts once the UI
    /// reports them ready.
    pub require_surface_ack: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            layout: WorkflowLayout::Tabs,
            require_surface_ack: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Modes {
    pub workflow_enabled: bool,
    pub relay_enabled: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RelayState {
    pub in_progress: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: EngineSettings,
    pub modes: Modes,
    pub relay: RelayState,
    pub contexts: SessionRegistry,
    pub transitions: BTreeMap<u64, WorkflowTransition>,
    pub last_error: Option<String>,
    pub(crate) patterns: Arc<dyn PatternMatcher>,
    pub(crate) next_transition_id: u64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("settings", &self.settings)
            .field("modes", &self.modes)
            .field("relay", &self.relay)
            .field("contexts", &self.contexts)
            .field("transitions", &self.transitions)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        Self::with_patterns(settings, Arc::new(RegexPatternRegistry::standard()))
    }

    pub fn with_patterns(settings: EngineSettings, patterns: Arc<dyn PatternMatcher>) -> Self {
        Self {
            settings,
            modes: Modes::default(),
            relay: RelayState::default(),
            contexts: SessionRegistry::new(),
            transitions: BTreeMap::new(),
            last_error: None,
            patterns,
            next_transition_id: 1,
        }
    }

    pub fn context(&self, id: &ContextId) -> Option<&ChatContext> {
        self.contexts.get(id)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

mod actions;
pub use actions::{Action, DispatchFailure, DispatchReply};
mod effects;
pub use effects::{DispatchPlan, Effect};

mod patterns;
pub use patterns::{
    PatternMatcher, RegexPatternRegistry, RuleCaptures, RuleKind, WORKFLOW_RULES,
    WorkflowActionRule, WorkflowMatch,
};

mod run_config;
pub use run_config::{
    ConfigFallback, DEFAULT_MODEL_ID, FALLBACK_MODEL_ID, FALLBACK_PRESET_ID, ResolvedConfig,
    RunConfig, default_run_config, resolve_model, resolve_preset, resolve_run_config,
};

mod persistence;
mod relay;
mod state;
pub use state::*;

mod workflow;
pub use workflow::{MAX_DELIVERY_RETRIES, TransitionStage, WorkflowTransition};

mod reducer;

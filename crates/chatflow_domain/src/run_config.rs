/// Model used for prompts on contexts that were never configured.
pub const DEFAULT_MODEL_ID: &str = "claude-3-5-sonnet-20241022";

/// Substituted when a requested model is not offered by the backend.
pub const FALLBACK_MODEL_ID: &str = "claude-3-5-sonnet-20241022";

/// Substituted when a requested preset is not offered by the backend.
pub const FALLBACK_PRESET_ID: &str = "default";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunConfig {
    pub model_id: String,
    pub preset_id: Option<String>,
    pub description: Option<String>,
    pub target_context_id: Option<String>,
}

impl RunConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            preset_id: None,
            description: None,
            target_context_id: None,
        }
    }

    pub fn with_preset(mut self, preset_id: impl Into<String>) -> Self {
        self.preset_id = Some(preset_id.into());
        self
    }
}

pub fn default_run_config() -> RunConfig {
    RunConfig::new(DEFAULT_MODEL_ID)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigFallback {
    Model {
        requested: String,
        substituted: String,
    },
    Preset {
        requested: String,
        substituted: Option<String>,
    },
}

impl std::fmt::Display for ConfigFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigFallback::Model {
                requested,
                substituted,
            } => write!(
                f,
                "model {requested} is not available, using {substituted} instead"
            ),
            ConfigFallback::Preset {
                requested,
                substituted: Some(substituted),
            } => write!(
                f,
                "preset {requested} is not available, using {substituted} instead"
            ),
            ConfigFallback::Preset {
                requested,
                substituted: None,
            } => write!(
                f,
                "preset {requested} and fallback preset {FALLBACK_PRESET_ID} are not available, continuing without a preset"
            ),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedConfig {
    pub config: RunConfig,
    pub fallbacks: Vec<ConfigFallback>,
}

pub fn resolve_model(requested: &str, available: &[String]) -> (String, Option<ConfigFallback>) {
    if available.iter().any(|id| id == requested) {
        return (requested.to_owned(), None);
    }
    (
        FALLBACK_MODEL_ID.to_owned(),
        Some(ConfigFallback::Model {
            requested: requested.to_owned(),
            substituted: FALLBACK_MODEL_ID.to_owned(),
        }),
    )
}

pub fn resolve_preset(
    requested: Option<&str>,
    available: &[String],
) -> (Option<String>, Option<ConfigFallback>) {
    let Some(requested) = requested else {
        return (None, None);
    };
    if available.iter().any(|id| id == requested) {
        return (Some(requested.to_owned()), None);
    }

    let substituted = available
        .iter()
        .any(|id| id == FALLBACK_PRESET_ID)
        .then(|| FALLBACK_PRESET_ID.to_owned());
    (
        substituted.clone(),
        Some(ConfigFallback::Preset {
            requested: requested.to_owned(),
            substituted,
        }),
    )
}

/// Applies the fallback chain to `desired` against the currently offered ids.
pub fn resolve_run_config(
    desired: &RunConfig,
    models: &[String],
    presets: &[String],
) -> ResolvedConfig {
    let mut fallbacks = Vec::new();

    let (model_id, model_fallback) = resolve_model(&desired.model_id, models);
    fallbacks.extend(model_fallback);

    let (preset_id, preset_fallback) = resolve_preset(desired.preset_id.as_deref(), presets);
    fallbacks.extend(preset_fallback);

    ResolvedConfig {
        config: RunConfig {
            model_id,
            preset_id,
            description: desired.description.clone(),
            target_context_id: desired.target_context_id.clone(),
        },
        fallbacks,
    }
}

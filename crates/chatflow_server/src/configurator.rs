use crate::catalog::Catalog;
use chatflow_domain::{ResolvedConfig, RunConfig, resolve_model, resolve_run_config};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigureError {
    /// The catalog did not arrive in time. `partial` holds whatever could
    /// already be selected.
    Timeout { partial: Option<RunConfig> },
    CatalogClosed,
}

impl std::fmt::Display for ConfigureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigureError::Timeout { partial: None } => {
                f.write_str("timed out waiting for the model list")
            }
            ConfigureError::Timeout { partial: Some(_) } => {
                f.write_str("timed out waiting for the preset list")
            }
            ConfigureError::CatalogClosed => f.write_str("catalog is no longer available"),
        }
    }
}

impl std::error::Error for ConfigureError {}

/// Selects `desired` (or its fallbacks) once the catalog is known.
pub async fn configure(
    mut catalog: watch::Receiver<Catalog>,
    desired: &RunConfig,
    timeout: Duration,
) -> Result<ResolvedConfig, ConfigureError> {
    let deadline = tokio::time::Instant::now() + timeout;

    let models = match tokio::time::timeout_at(
        deadline,
        catalog.wait_for(|catalog| catalog.models.is_some()),
    )
    .await
    {
        Ok(Ok(catalog)) => catalog.model_ids(),
        Ok(Err(_)) => return Err(ConfigureError::CatalogClosed),
        Err(_) => return Err(ConfigureError::Timeout { partial: None }),
    };

    if desired.preset_id.is_none() {
        return Ok(resolve_run_config(desired, &models, &[]));
    }

    let presets = match tokio::time::timeout_at(
        deadline,
        catalog.wait_for(|catalog| catalog.presets.is_some()),
    )
    .await
    {
        Ok(Ok(catalog)) => catalog.preset_ids(),
        Ok(Err(_)) => return Err(ConfigureError::CatalogClosed),
        Err(_) => {
            let (model_id, _) = resolve_model(&desired.model_id, &models);
            return Err(ConfigureError::Timeout {
                partial: Some(RunConfig {
                    model_id,
                    preset_id: None,
                    description: desired.description.clone(),
                    target_context_id: desired.target_context_id.clone(),
                }),
            });
        }
    };

    Ok(resolve_run_config(desired, &models, &presets))
}

use std::path::{Path, PathBuf};

use tracing::info;
use votegate_config::ResolvedConfig;

use crate::cli::ModelArgs;
use crate::errors::AppResult;

/// `--config` value shared by every handler.
pub type ConfigLocation = Option<PathBuf>;

/// Loads configuration from `explicit` or the default search paths and logs
/// where it came from.
pub fn load(explicit: Option<&Path>) -> AppResult<ResolvedConfig> {
    let loaded = votegate_config::load_resolved_config_with(explicit)?;
    match &loaded.source {
        Some(source) => info!(
            target: "config",
            "Loaded configuration from {}",
            source.display()
        ),
        None => info!(target: "config", "No config file found; using built-in defaults"),
    }
    Ok(loaded.resolved)
}

/// Command-line model paths win over configured ones.
pub fn apply_model_overrides(config: &mut ResolvedConfig, models: &ModelArgs) {
    if let Some(path) = &models.landmark_model {
        config.landmark_model = Some(path.clone());
    }
    if let Some(path) = &models.encoder_model {
        config.encoder_model = Some(path.clone());
    }
}

pub fn load_with_models(explicit: Option<&Path>, models: &ModelArgs) -> AppResult<ResolvedConfig> {
    let mut config = load(explicit)?;
    apply_model_overrides(&mut config, models);
    Ok(config)
}

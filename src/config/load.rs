use super::{ConfigError, HarnessConfig};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "TERRAFORM_AWS_MFA_CONFIG";
pub const BINARY_ENV: &str = "TERRAFORM_BINARY";

/// Loads the harness config from `explicit`, else `$TERRAFORM_AWS_MFA_CONFIG`,
/// else defaults, and applies `$TERRAFORM_BINARY`.
pub fn load_harness_config(explicit: Option<&Path>) -> Result<HarnessConfig, ConfigError> {
    let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let binary = std::env::var(BINARY_ENV).ok();
    load_harness_config_with(explicit, env_path.as_deref(), binary)
}

pub fn load_harness_config_with(
    explicit: Option<&Path>,
    env_path: Option<&Path>,
    binary_override: Option<String>,
) -> Result<HarnessConfig, ConfigError> {
    let mut config = match explicit.or(env_path) {
        Some(path) => HarnessConfig::from_path(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(binary) = binary_override.filter(|b| !b.trim().is_empty()) {
        config.terraform_binary = binary;
    }
    config.validate()?;
    Ok(config)
}

use super::ConfigError;
use crate::terraform::{
    default_retryable_errors, Options, DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_RETRIES,
    DEFAULT_TERRAFORM_BINARY, DEFAULT_TIME_BETWEEN_RETRIES,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TERRAFORM_DIR: &str = "demos/simple";

fn default_terraform_dir() -> PathBuf {
    PathBuf::from(DEFAULT_TERRAFORM_DIR)
}

fn default_terraform_binary() -> String {
    DEFAULT_TERRAFORM_BINARY.to_string()
}

fn default_time_between_retries_secs() -> u64 {
    DEFAULT_TIME_BETWEEN_RETRIES.as_secs()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

/// On-disk harness configuration. Relative paths resolve against the
/// directory holding the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default = "default_terraform_dir")]
    pub terraform_dir: PathBuf,
    #[serde(default = "default_terraform_binary")]
    pub terraform_binary: String,
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub var_files: Vec<PathBuf>,
    #[serde(default)]
    pub backend_config: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Opts into the built-in transient-error patterns. Off by default, so
    /// every failure is terminal unless configured otherwise.
    #[serde(default)]
    pub default_retryable_errors: bool,
    /// Explicit retryable patterns; takes precedence over the built-in set.
    #[serde(default)]
    pub retryable_errors: Option<BTreeMap<String, String>>,
    /// Added on top of whichever retryable set is active.
    #[serde(default)]
    pub extra_retryable_errors: BTreeMap<String, String>,
    /// Defaults to 0, or to the built-in count when the built-in patterns are enabled.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_time_between_retries_secs")]
    pub time_between_retries_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub no_color: bool,
    #[serde(default)]
    pub lock: Option<bool>,
    #[serde(default)]
    pub lock_timeout: Option<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub upgrade: bool,
    #[serde(default)]
    pub reconfigure: bool,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub isolate: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            terraform_dir: default_terraform_dir(),
            terraform_binary: default_terraform_binary(),
            vars: BTreeMap::new(),
            var_files: Vec::new(),
            backend_config: BTreeMap::new(),
            env: BTreeMap::new(),
            default_retryable_errors: false,
            retryable_errors: None,
            extra_retryable_errors: BTreeMap::new(),
            max_retries: None,
            time_between_retries_secs: default_time_between_retries_secs(),
            timeout_secs: default_timeout_secs(),
            no_color: true,
            lock: None,
            lock_timeout: None,
            parallelism: None,
            upgrade: false,
            reconfigure: false,
            log_path: None,
            isolate: true,
        }
    }
}

impl HarnessConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        self.terraform_dir = resolve(self.terraform_dir.as_path());
        self.var_files = self.var_files.iter().map(|p| resolve(p.as_path())).collect();
        self.log_path = self.log_path.as_deref().map(resolve);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terraform_binary.trim().is_empty() {
            return Err(ConfigError::Harness(
                "`terraform_binary` must be non-empty".to_string(),
            ));
        }
        if self.terraform_dir.as_os_str().is_empty() {
            return Err(ConfigError::Harness(
                "`terraform_dir` must be non-empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Harness(
                "`timeout_secs` must be greater than zero".to_string(),
            ));
        }
        if self.parallelism == Some(0) {
            return Err(ConfigError::Harness(
                "`parallelism` must be greater than zero".to_string(),
            ));
        }
        for key in self.vars.keys().chain(self.backend_config.keys()) {
            if key.trim().is_empty() || key.contains('=') {
                return Err(ConfigError::Harness(format!(
                    "invalid variable or backend key `{key}`"
                )));
            }
        }
        Ok(())
    }

    pub fn to_options(&self) -> Options {
        let mut retryable = match &self.retryable_errors {
            Some(explicit) => explicit.clone(),
            None if self.default_retryable_errors => default_retryable_errors(),
            None => BTreeMap::new(),
        };
        retryable.extend(self.extra_retryable_errors.clone());
        let max_retries = self.max_retries.unwrap_or(if self.default_retryable_errors {
            DEFAULT_MAX_RETRIES
        } else {
            0
        });

        let mut options = Options::new(&self.terraform_dir);
        options.terraform_binary = self.terraform_binary.clone();
        options.vars = self.vars.clone();
        options.var_files = self.var_files.clone();
        options.backend_config = self.backend_config.clone();
        options.env_vars = self.env.clone();
        options.retryable_errors = retryable;
        options.max_retries = max_retries;
        options.time_between_retries = Duration::from_secs(self.time_between_retries_secs);
        options.timeout = Duration::from_secs(self.timeout_secs);
        options.no_color = self.no_color;
        options.lock = self.lock;
        options.lock_timeout = self.lock_timeout.clone();
        options.parallelism = self.parallelism;
        options.upgrade = self.upgrade;
        options.reconfigure = self.reconfigure;
        options.log_path = self.log_path.clone();
        options
    }
}

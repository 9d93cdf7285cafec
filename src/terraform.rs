use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod invocation;
pub mod lifecycle;
pub mod output_parse;
pub mod retry;
pub mod runner;

pub use invocation::build_invocation;
pub use lifecycle::{
    destroy, init_and_apply, output, with_infrastructure, DestroyGuard, LifecycleError,
};
pub use output_parse::{parse_output_json, parse_resource_count, OutputValue, ResourceCount};
pub use retry::{default_retryable_errors, RetryPolicy};
pub use runner::run_command;

pub const DEFAULT_TERRAFORM_BINARY: &str = "terraform";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const OUTPUT_TAIL_LINES: usize = 20;
pub const DEFAULT_TIME_BETWEEN_RETRIES: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum TerraformError {
    #[error("invalid terraform options: {0}")]
    InvalidOptions(String),
    #[error("terraform binary missing for {subcommand}: {binary}")]
    MissingBinary {
        subcommand: Subcommand,
        binary: String,
        log: Box<InvocationLog>,
    },
    #[error("terraform {subcommand} failed with exit code {exit_code}: {stderr}")]
    NonZeroExit {
        subcommand: Subcommand,
        exit_code: i32,
        stdout: String,
        stderr: String,
        log: Box<InvocationLog>,
    },
    #[error(
        "terraform {subcommand} timed out after {timeout_ms}ms: {}",
        output_tail(.stdout, .stderr)
    )]
    Timeout {
        subcommand: Subcommand,
        timeout_ms: u64,
        stdout: String,
        stderr: String,
        log: Box<InvocationLog>,
    },
    #[error("terraform {subcommand} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        subcommand: Subcommand,
        attempts: u32,
        last: Box<TerraformError>,
    },
    #[error("terraform {subcommand} output parse failure: {reason}")]
    ParseFailure {
        subcommand: Subcommand,
        reason: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl TerraformError {
    /// Invocation log of the failed process, when one was spawned.
    pub fn log(&self) -> Option<&InvocationLog> {
        match self {
            Self::MissingBinary { log, .. }
            | Self::NonZeroExit { log, .. }
            | Self::Timeout { log, .. } => Some(&**log),
            Self::RetriesExhausted { last, .. } => last.log(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Init,
    Apply,
    Destroy,
    Output,
}

impl Subcommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Output => "output",
        }
    }
}

impl std::fmt::Display for Subcommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything needed to drive one root module through its lifecycle.
#[derive(Debug, Clone)]
pub struct Options {
    pub terraform_dir: PathBuf,
    pub terraform_binary: String,
    pub vars: BTreeMap<String, serde_json::Value>,
    pub var_files: Vec<PathBuf>,
    pub backend_config: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
    pub retryable_errors: BTreeMap<String, String>,
    pub max_retries: u32,
    pub time_between_retries: Duration,
    pub timeout: Duration,
    pub no_color: bool,
    pub lock: Option<bool>,
    pub lock_timeout: Option<String>,
    pub parallelism: Option<u32>,
    pub upgrade: bool,
    pub reconfigure: bool,
    pub log_path: Option<PathBuf>,
}

impl Options {
    pub fn new(terraform_dir: impl Into<PathBuf>) -> Self {
        Self {
            terraform_dir: terraform_dir.into(),
            terraform_binary: DEFAULT_TERRAFORM_BINARY.to_string(),
            vars: BTreeMap::new(),
            var_files: Vec::new(),
            backend_config: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            retryable_errors: BTreeMap::new(),
            max_retries: 0,
            time_between_retries: DEFAULT_TIME_BETWEEN_RETRIES,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            no_color: true,
            lock: None,
            lock_timeout: None,
            parallelism: None,
            upgrade: false,
            reconfigure: false,
            log_path: None,
        }
    }

    /// Retries the built-in transient failures, `DEFAULT_MAX_RETRIES` times.
    pub fn with_default_retryable_errors(mut self) -> Self {
        self.retryable_errors = default_retryable_errors();
        self.max_retries = DEFAULT_MAX_RETRIES;
        self.time_between_retries = DEFAULT_TIME_BETWEEN_RETRIES;
        self
    }

    pub fn with_var(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env_vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Checks the record before any process is spawned.
    pub fn validate(&self) -> Result<(), TerraformError> {
        if self.terraform_binary.trim().is_empty() {
            return Err(TerraformError::InvalidOptions(
                "terraform_binary must be non-empty".to_string(),
            ));
        }
        if !self.terraform_dir.is_dir() {
            return Err(TerraformError::InvalidOptions(format!(
                "terraform_dir {} is not a directory",
                self.terraform_dir.display()
            )));
        }
        if !contains_configuration(&self.terraform_dir)? {
            return Err(TerraformError::InvalidOptions(format!(
                "terraform_dir {} contains no .tf or .tf.json files",
                self.terraform_dir.display()
            )));
        }
        if self.parallelism == Some(0) {
            return Err(TerraformError::InvalidOptions(
                "parallelism must be greater than zero".to_string(),
            ));
        }
        RetryPolicy::from_options(self)?;
        Ok(())
    }
}

/// Last lines of the tool output, stderr first, for error messages.
fn output_tail(stdout: &str, stderr: &str) -> String {
    let tail = |text: &str| {
        let lines: Vec<&str> = text.trim_end().lines().collect();
        let skip = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        lines[skip..].join("\n")
    };
    let parts: Vec<String> = [tail(stderr), tail(stdout)]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        return "no output".to_string();
    }
    parts.join("\n")
}

fn contains_configuration(dir: &Path) -> Result<bool, TerraformError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if (name.ends_with(".tf") || name.ends_with(".tf.json")) && entry.path().is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub subcommand: Subcommand,
    pub binary: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl InvocationSpec {
    pub fn command_form(&self) -> String {
        if self.args.is_empty() {
            return self.binary.clone();
        }
        format!("{} {}", self.binary, self.args.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct InvocationLog {
    pub subcommand: Subcommand,
    pub command_form: String,
    pub working_directory: PathBuf,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub log: InvocationLog,
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> TerraformError {
    TerraformError::Io {
        path: path.display().to_string(),
        source,
    }
}

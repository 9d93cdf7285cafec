use crate::shared::logging::{append_harness_log, LogLevel};
use crate::terraform::output_parse::{parse_output_json, OutputValue};
use crate::terraform::runner::run_command;
use crate::terraform::{CommandOutput, Options, Subcommand, TerraformError};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::thread;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("apply failed: {0}")]
    Apply(#[source] TerraformError),
    #[error("test body failed: {0}")]
    Body(String),
    #[error("destroy failed: {0}")]
    Destroy(#[source] TerraformError),
    #[error("{primary}; destroy also failed: {destroy}")]
    Both {
        primary: Box<LifecycleError>,
        destroy: TerraformError,
    },
}

pub fn init(options: &Options) -> Result<CommandOutput, TerraformError> {
    options.validate()?;
    run_command(options, Subcommand::Init)
}

/// Runs `init` then `apply`; returns the apply output.
pub fn init_and_apply(options: &Options) -> Result<CommandOutput, TerraformError> {
    init(options)?;
    run_command(options, Subcommand::Apply)
}

pub fn destroy(options: &Options) -> Result<CommandOutput, TerraformError> {
    options.validate()?;
    run_command(options, Subcommand::Destroy)
}

pub fn output(options: &Options) -> Result<BTreeMap<String, OutputValue>, TerraformError> {
    options.validate()?;
    let out = run_command(options, Subcommand::Output)?;
    parse_output_json(&out.stdout)
}

/// Destroys the root module exactly once when finished or dropped.
///
/// Schedule it before applying so that cleanup happens on every exit path.
/// A failed destroy during drop panics, unless the thread is already
/// unwinding, in which case it is logged and the original panic wins.
#[derive(Debug)]
pub struct DestroyGuard<'a> {
    options: &'a Options,
    done: bool,
}

impl<'a> DestroyGuard<'a> {
    pub fn schedule(options: &'a Options) -> Self {
        Self {
            options,
            done: false,
        }
    }

    pub fn finish(mut self) -> Result<CommandOutput, TerraformError> {
        self.done = true;
        destroy(self.options)
    }
}

impl Drop for DestroyGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let Err(err) = destroy(self.options) else {
            return;
        };
        append_harness_log(
            self.options.log_path.as_deref(),
            LogLevel::Error,
            "destroy.deferred_failed",
            &err.to_string(),
            serde_json::Value::Null,
        );
        if !thread::panicking() {
            panic!("deferred terraform destroy failed: {err}");
        }
    }
}

/// Applies the root module, runs `body` against the apply output, then
/// destroys. Destroy runs whether apply or the body succeeded.
pub fn with_infrastructure<T, E, F>(options: &Options, body: F) -> Result<T, LifecycleError>
where
    F: FnOnce(&CommandOutput) -> Result<T, E>,
    E: Display,
{
    // Nothing can have been created from an invalid record.
    options.validate().map_err(LifecycleError::Apply)?;

    let guard = DestroyGuard::schedule(options);
    let outcome = match init_and_apply(options) {
        Ok(applied) => body(&applied).map_err(|err| LifecycleError::Body(err.to_string())),
        Err(err) => Err(LifecycleError::Apply(err)),
    };
    let destroyed = guard.finish();

    match (outcome, destroyed) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(err)) => Err(LifecycleError::Destroy(err)),
        (Err(primary), Ok(_)) => Err(primary),
        (Err(primary), Err(destroy)) => Err(LifecycleError::Both {
            primary: Box::new(primary),
            destroy,
        }),
    }
}

use crate::terraform::{Options, TerraformError};
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Known transient failures; the description ends up in the harness log.
const DEFAULT_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    (
        r"(?m)^.*Error installing provider.*(tcp|connection reset by peer).*$",
        "Failed to download a provider plugin due to a transient network error.",
    ),
    (
        r"(?m)^.*Failed to query available provider packages.*$",
        "Provider registry lookup failed.",
    ),
    (
        r"(?s).*Could not download module.*(timeout|timed out).*",
        "Module download timed out.",
    ),
    (
        r"(?m)^.*net/http: TLS handshake timeout.*$",
        "TLS handshake with the registry timed out.",
    ),
    (
        r"(?m)^.*(RequestLimitExceeded|Throttling|ThrottlingException).*$",
        "AWS API throttled the request.",
    ),
    (
        r"(?m)^.*NoSuchEntity.*$",
        "IAM entity not visible yet (eventual consistency).",
    ),
    (
        r"(?m)^.*is not authorized to perform: sts:AssumeRole.*$",
        "IAM role trust policy not propagated yet.",
    ),
];

pub fn default_retryable_errors() -> BTreeMap<String, String> {
    DEFAULT_RETRYABLE_ERRORS
        .iter()
        .map(|(pattern, description)| (pattern.to_string(), description.to_string()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    patterns: Vec<(Regex, String)>,
    pub max_retries: u32,
    pub time_between_retries: Duration,
}

impl RetryPolicy {
    pub fn from_options(options: &Options) -> Result<Self, TerraformError> {
        let mut patterns = Vec::with_capacity(options.retryable_errors.len());
        for (pattern, description) in &options.retryable_errors {
            let regex = Regex::new(pattern).map_err(|err| {
                TerraformError::InvalidOptions(format!(
                    "retryable error pattern `{pattern}` is invalid: {err}"
                ))
            })?;
            patterns.push((regex, description.clone()));
        }
        Ok(Self {
            patterns,
            max_retries: options.max_retries,
            time_between_retries: options.time_between_retries,
        })
    }

    /// Description of the first pattern matching the failed command's output.
    pub fn retryable_reason(&self, err: &TerraformError) -> Option<&str> {
        let TerraformError::NonZeroExit { stdout, stderr, .. } = err else {
            return None;
        };
        let combined = format!("{stdout}\n{stderr}");
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(&combined))
            .map(|(_, description)| description.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terraform::{InvocationLog, Subcommand};
    use std::path::PathBuf;

    fn failure(stderr: &str) -> TerraformError {
        failure_with_stdout("", stderr)
    }

    fn failure_with_stdout(stdout: &str, stderr: &str) -> TerraformError {
        TerraformError::NonZeroExit {
            subcommand: Subcommand::Apply,
            exit_code: 1,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            log: Box::new(InvocationLog {
                subcommand: Subcommand::Apply,
                command_form: "terraform apply".to_string(),
                working_directory: PathBuf::from("."),
                exit_code: Some(1),
                attempts: 1,
                timed_out: false,
            }),
        }
    }

    #[test]
    fn throttling_and_iam_propagation_are_retryable() {
        let policy = RetryPolicy::from_options(&Options::new(".").with_default_retryable_errors())
            .expect("policy");
        assert_eq!(
            policy.retryable_reason(&failure(
                "Error: creating IAM Policy: Throttling: Rate exceeded"
            )),
            Some("AWS API throttled the request.")
        );
        assert!(policy
            .retryable_reason(&failure("Error: NoSuchEntity: The group cannot be found"))
            .is_some());
    }

    #[test]
    fn configuration_errors_are_terminal() {
        let policy = RetryPolicy::from_options(&Options::new(".").with_default_retryable_errors())
            .expect("policy");
        assert!(policy
            .retryable_reason(&failure("Error: Unsupported argument \"nmae\""))
            .is_none());
        let timeout = TerraformError::InvalidOptions("x".to_string());
        assert!(policy.retryable_reason(&timeout).is_none());
    }

    #[test]
    fn custom_patterns_replace_defaults() {
        let mut options = Options::new(".");
        options.retryable_errors.clear();
        options
            .retryable_errors
            .insert("state lock".to_string(), "lock held".to_string());
        let policy = RetryPolicy::from_options(&options).expect("policy");
        assert_eq!(
            policy.retryable_reason(&failure("Error acquiring the state lock")),
            Some("lock held")
        );
        assert!(policy
            .retryable_reason(&failure("Throttling: Rate exceeded"))
            .is_none());
    }

    #[test]
    fn patterns_match_across_stdout_and_stderr() {
        let mut options = Options::new(".");
        options.retryable_errors.insert(
            r"(?s)Creating\.\.\..*connection reset by peer".to_string(),
            "reset mid-create".to_string(),
        );
        let policy = RetryPolicy::from_options(&options).expect("policy");
        let err = failure_with_stdout(
            "aws_iam_group.this: Creating...",
            "Error: read tcp: connection reset by peer",
        );
        assert_eq!(policy.retryable_reason(&err), Some("reset mid-create"));
    }

    #[test]
    fn plain_options_have_no_retryable_patterns() {
        let policy = RetryPolicy::from_options(&Options::new(".")).expect("policy");
        assert_eq!(policy.max_retries, 0);
        assert!(policy
            .retryable_reason(&failure("Error: Throttling: Rate exceeded"))
            .is_none());
    }
}

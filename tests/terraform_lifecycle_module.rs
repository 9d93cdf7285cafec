use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use terraform_aws_mfa::terraform::{
    destroy, init_and_apply, output, parse_resource_count, run_command, with_infrastructure,
    DestroyGuard, LifecycleError, Options, Subcommand, TerraformError,
};

const FAKE_TERRAFORM: &str = r#"#!/bin/sh
echo "$*" >> "$FAKE_TF_CALLS"
case "$1" in
  init)
    echo "Terraform has been successfully initialized!"
    ;;
  apply)
    if [ -n "$FAKE_TF_HANG" ]; then
      exec sleep 5
    fi
    if [ -n "$FAKE_TF_SLOW" ]; then
      echo "aws_iam_group.this: Still creating... [10s elapsed]"
      echo "Warning: waiting on IAM" >&2
      sleep 4
      echo "Apply complete! Resources: 3 added, 0 changed, 0 destroyed."
      exit 0
    fi
    if [ -n "$FAKE_TF_FLAKY" ]; then
      n=$(grep -c '^apply' "$FAKE_TF_CALLS")
      if [ "$n" -le "$FAKE_TF_FLAKY" ]; then
        echo "Error: creating IAM Group: Throttling: Rate exceeded" >&2
        exit 1
      fi
    fi
    if [ -n "$FAKE_TF_APPLY_FAIL" ]; then
      echo "Error: $FAKE_TF_APPLY_FAIL" >&2
      exit 1
    fi
    echo "Apply complete! Resources: 3 added, 0 changed, 0 destroyed."
    ;;
  destroy)
    if [ -n "$FAKE_TF_DESTROY_FAIL" ]; then
      echo "Error: $FAKE_TF_DESTROY_FAIL" >&2
      exit 1
    fi
    echo "Destroy complete! Resources: 3 destroyed."
    ;;
  output)
    echo '{"group_name":{"sensitive":false,"type":"string","value":"mfa-enforced-1a2b3c4d"}}'
    ;;
esac
"#;

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

struct Fixture {
    dir: TempDir,
    options: Options,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().expect("tempdir");
        let module = dir.path().join("simple");
        fs::create_dir_all(&module).expect("create module");
        fs::write(module.join("main.tf"), "resource \"aws_iam_group\" \"this\" {}\n")
            .expect("write main.tf");
        let bin = dir.path().join("terraform-mock");
        write_script(&bin, FAKE_TERRAFORM);

        let mut options = Options::new(&module)
            .with_env("FAKE_TF_CALLS", &dir.path().join("calls.log").display().to_string());
        options.terraform_binary = bin.display().to_string();
        options.time_between_retries = Duration::ZERO;
        options.timeout = Duration::from_secs(10);
        Self { dir, options }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.options = self.options.with_env(key, value);
        self
    }

    fn retrying(mut self, max_retries: u32) -> Self {
        self.options = self.options.with_default_retryable_errors();
        self.options.max_retries = max_retries;
        self.options.time_between_retries = Duration::ZERO;
        self
    }

    fn log_events(&self) -> Vec<Value> {
        fs::read_to_string(self.log_path())
            .expect("read log")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("calls.log"))
            .map(|raw| raw.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn count(&self, subcommand: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(subcommand))
            .count()
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("logs/harness.log")
    }
}

#[test]
fn apply_then_destroy_runs_init_apply_destroy_in_order() {
    let fixture = Fixture::new();

    let applied = init_and_apply(&fixture.options).expect("apply");
    let count = parse_resource_count(Subcommand::Apply, &applied.stdout).expect("count");
    assert_eq!(count.added, 3);
    assert_eq!(applied.log.exit_code, Some(0));

    let destroyed = destroy(&fixture.options).expect("destroy");
    assert!(destroyed.stdout.contains("Destroy complete!"));

    let calls = fixture.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].starts_with("init -input=false"));
    assert!(calls[1].starts_with("apply -input=false -auto-approve"));
    assert!(calls[2].starts_with("destroy -auto-approve -input=false"));
}

#[test]
fn with_infrastructure_returns_body_value_after_destroy() {
    let fixture = Fixture::new();
    let summary = with_infrastructure(&fixture.options, |applied| {
        parse_resource_count(Subcommand::Apply, &applied.stdout)
    })
    .expect("lifecycle");
    assert_eq!(summary.added, 3);
    assert_eq!(fixture.count("destroy"), 1);
}

#[test]
fn destroy_still_runs_when_apply_fails() {
    let fixture = Fixture::new().with_env("FAKE_TF_APPLY_FAIL", "Unsupported argument");

    let err = with_infrastructure(&fixture.options, |_| Ok::<_, String>(()))
        .expect_err("apply should fail");
    match err {
        LifecycleError::Apply(TerraformError::NonZeroExit { stderr, .. }) => {
            assert!(stderr.contains("Unsupported argument"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.count("apply"), 1);
    assert_eq!(fixture.count("destroy"), 1);
}

#[test]
fn destroy_still_runs_when_body_fails() {
    let fixture = Fixture::new();
    let err = with_infrastructure(&fixture.options, |_| Err::<(), _>("group missing"))
        .expect_err("body should fail");
    assert!(matches!(err, LifecycleError::Body(ref msg) if msg == "group missing"));
    assert_eq!(fixture.count("destroy"), 1);
}

#[test]
fn apply_and_destroy_failures_are_both_reported() {
    let fixture = Fixture::new()
        .with_env("FAKE_TF_APPLY_FAIL", "EntityAlreadyExists")
        .with_env("FAKE_TF_DESTROY_FAIL", "DeleteConflict");

    let err = with_infrastructure(&fixture.options, |_| Ok::<_, String>(()))
        .expect_err("both fail");
    let text = err.to_string();
    assert!(matches!(err, LifecycleError::Both { .. }));
    assert!(text.contains("EntityAlreadyExists"), "{text}");
    assert!(text.contains("DeleteConflict"), "{text}");
}

#[test]
fn successful_apply_with_failed_destroy_fails_the_run() {
    let fixture = Fixture::new().with_env("FAKE_TF_DESTROY_FAIL", "DeleteConflict");
    let err = with_infrastructure(&fixture.options, |_| Ok::<_, String>(()))
        .expect_err("destroy fails");
    assert!(matches!(err, LifecycleError::Destroy(_)));
}

#[test]
fn destroy_guard_runs_once_when_the_test_body_panics() {
    let fixture = Fixture::new();
    let options = &fixture.options;

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _guard = DestroyGuard::schedule(options);
        init_and_apply(options).expect("apply");
        panic!("assertion inside test body");
    }));
    assert!(result.is_err());
    assert_eq!(fixture.count("destroy"), 1);
}

#[test]
fn destroy_guard_finish_prevents_a_second_destroy() {
    let fixture = Fixture::new();
    let guard = DestroyGuard::schedule(&fixture.options);
    init_and_apply(&fixture.options).expect("apply");
    guard.finish().expect("destroy");
    assert_eq!(fixture.count("destroy"), 1);
}

#[test]
fn destroy_guard_drop_panics_when_destroy_fails() {
    let fixture = Fixture::new().with_env("FAKE_TF_DESTROY_FAIL", "DeleteConflict");
    let options = &fixture.options;

    let result = catch_unwind(AssertUnwindSafe(|| {
        let guard = DestroyGuard::schedule(options);
        drop(guard);
    }));
    assert!(result.is_err());
    assert_eq!(fixture.count("destroy"), 1);
}

#[test]
fn destroy_guard_logs_instead_of_double_panicking() {
    let mut fixture = Fixture::new().with_env("FAKE_TF_DESTROY_FAIL", "DeleteConflict");
    fixture.options.log_path = Some(fixture.log_path());
    let options = &fixture.options;

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _guard = DestroyGuard::schedule(options);
        panic!("assertion inside test body");
    }));
    let payload = result.expect_err("body panic propagates");
    assert_eq!(
        payload.downcast_ref::<&str>().copied(),
        Some("assertion inside test body")
    );
    assert_eq!(fixture.count("destroy"), 1);

    let deferred: Vec<Value> = fixture
        .log_events()
        .into_iter()
        .filter(|event| event["event"] == "destroy.deferred_failed")
        .collect();
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0]["level"], "error");
    assert!(deferred[0]["message"]
        .as_str()
        .unwrap_or_default()
        .contains("DeleteConflict"));
}

#[test]
fn default_options_do_not_retry() {
    let fixture = Fixture::new().with_env("FAKE_TF_FLAKY", "1");

    let err = run_command(&fixture.options, Subcommand::Apply).expect_err("terminal");
    assert!(matches!(err, TerraformError::NonZeroExit { .. }));
    assert_eq!(fixture.count("apply"), 1);
}

#[test]
fn max_retries_zero_returns_first_error_unchanged() {
    let fixture = Fixture::new().with_env("FAKE_TF_FLAKY", "5").retrying(0);

    let err = run_command(&fixture.options, Subcommand::Apply).expect_err("terminal");
    match err {
        TerraformError::NonZeroExit { stderr, log, .. } => {
            assert!(stderr.contains("Throttling"));
            assert_eq!(log.attempts, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.count("apply"), 1);
}

#[test]
fn retryable_failures_are_retried_until_success() {
    let mut fixture = Fixture::new().with_env("FAKE_TF_FLAKY", "2").retrying(3);
    fixture.options.log_path = Some(fixture.log_path());

    let applied = run_command(&fixture.options, Subcommand::Apply).expect("apply");
    assert_eq!(applied.log.attempts, 3);
    assert_eq!(fixture.count("apply"), 3);

    let events: Vec<String> = fixture
        .log_events()
        .iter()
        .map(|value| value["event"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        events.iter().filter(|e| e.as_str() == "command.retry").count(),
        2
    );
    assert_eq!(events.last().map(String::as_str), Some("command.finish"));
}

#[test]
fn retries_stop_after_max_retries() {
    let fixture = Fixture::new().with_env("FAKE_TF_FLAKY", "10").retrying(2);

    let err = run_command(&fixture.options, Subcommand::Apply).expect_err("exhausted");
    match err {
        TerraformError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(last.to_string().contains("Throttling"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.count("apply"), 3);
}

#[test]
fn non_retryable_failures_are_not_retried() {
    let fixture = Fixture::new()
        .with_env("FAKE_TF_APPLY_FAIL", "Invalid reference")
        .retrying(5);

    let err = run_command(&fixture.options, Subcommand::Apply).expect_err("fails");
    assert!(matches!(
        err,
        TerraformError::NonZeroExit { exit_code: 1, .. }
    ));
    assert_eq!(fixture.count("apply"), 1);
}

#[test]
fn hung_commands_are_killed_at_the_timeout() {
    let mut fixture = Fixture::new().with_env("FAKE_TF_HANG", "1");
    fixture.options.timeout = Duration::from_millis(200);

    let err = run_command(&fixture.options, Subcommand::Apply).expect_err("timeout");
    match err {
        TerraformError::Timeout { log, .. } => assert!(log.timed_out),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.count("apply"), 1);
}

#[test]
fn timeout_kills_spawned_children_and_keeps_partial_output() {
    let mut fixture = Fixture::new().with_env("FAKE_TF_SLOW", "1");
    fixture.options.timeout = Duration::from_millis(300);

    let started = Instant::now();
    let err = run_command(&fixture.options, Subcommand::Apply).expect_err("timeout");
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "timeout took {:?}",
        started.elapsed()
    );

    let text = err.to_string();
    assert!(text.contains("Still creating"), "{text}");
    match err {
        TerraformError::Timeout {
            stdout,
            stderr,
            log,
            ..
        } => {
            assert!(log.timed_out);
            assert!(stdout.contains("Still creating"));
            assert!(stderr.contains("waiting on IAM"));
            assert!(!stdout.contains("Apply complete!"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_binary_is_reported_without_retry() {
    let mut fixture = Fixture::new();
    fixture.options.terraform_binary = fixture
        .dir
        .path()
        .join("no-such-terraform")
        .display()
        .to_string();

    let err = init_and_apply(&fixture.options).expect_err("missing");
    assert!(matches!(
        err,
        TerraformError::MissingBinary {
            subcommand: Subcommand::Init,
            ..
        }
    ));
}

#[test]
fn invalid_options_spawn_nothing() {
    let mut fixture = Fixture::new();
    fixture.options.terraform_dir = fixture.dir.path().join("absent");

    let err = with_infrastructure(&fixture.options, |_| Ok::<_, String>(()))
        .expect_err("invalid");
    assert!(matches!(
        err,
        LifecycleError::Apply(TerraformError::InvalidOptions(_))
    ));
    assert!(fixture.calls().is_empty());
}

#[test]
fn outputs_are_decoded_from_json() {
    let fixture = Fixture::new();
    let outputs = output(&fixture.options).expect("outputs");
    assert_eq!(outputs["group_name"].value, "mfa-enforced-1a2b3c4d");
    assert_eq!(fixture.calls(), vec!["output -json -no-color".to_string()]);
}

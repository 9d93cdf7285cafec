use crate::shared::logging::{append_harness_log, LogLevel};
use crate::terraform::invocation::build_invocation;
use crate::terraform::retry::RetryPolicy;
use crate::terraform::{
    io_error, CommandOutput, InvocationLog, InvocationSpec, Options, Subcommand, TerraformError,
};
use std::io::BufReader;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

const KILL_GRACE: Duration = Duration::from_millis(500);

/// Runs one subcommand, retrying failures whose output matches a retryable pattern.
pub fn run_command(
    options: &Options,
    subcommand: Subcommand,
) -> Result<CommandOutput, TerraformError> {
    let policy = RetryPolicy::from_options(options)?;
    let spec = build_invocation(options, subcommand);
    let log_path = options.log_path.as_deref();
    let max_attempts = policy.max_retries.saturating_add(1);

    let mut attempt = 1;
    loop {
        append_harness_log(
            log_path,
            LogLevel::Info,
            "command.start",
            &spec.command_form(),
            serde_json::json!({
                "subcommand": subcommand.as_str(),
                "attempt": attempt,
                "working_directory": options.terraform_dir.display().to_string(),
            }),
        );

        let err = match run_once(options, &spec, attempt) {
            Ok(output) => {
                append_harness_log(
                    log_path,
                    LogLevel::Info,
                    "command.finish",
                    &spec.command_form(),
                    serde_json::json!({
                        "subcommand": subcommand.as_str(),
                        "attempt": attempt,
                        "exit_code": output.log.exit_code,
                    }),
                );
                return Ok(output);
            }
            Err(err) => err,
        };

        let Some(reason) = policy.retryable_reason(&err) else {
            log_failure(log_path, subcommand, attempt, &err);
            return Err(err);
        };
        if attempt >= max_attempts {
            log_failure(log_path, subcommand, attempt, &err);
            if attempt == 1 {
                return Err(err);
            }
            return Err(TerraformError::RetriesExhausted {
                subcommand,
                attempts: attempt,
                last: Box::new(err),
            });
        }

        append_harness_log(
            log_path,
            LogLevel::Warn,
            "command.retry",
            reason,
            serde_json::json!({
                "subcommand": subcommand.as_str(),
                "attempt": attempt,
                "sleep_ms": policy.time_between_retries.as_millis() as u64,
            }),
        );
        thread::sleep(policy.time_between_retries);
        attempt += 1;
    }
}

fn log_failure(
    log_path: Option<&std::path::Path>,
    subcommand: Subcommand,
    attempt: u32,
    err: &TerraformError,
) {
    append_harness_log(
        log_path,
        LogLevel::Error,
        "command.failed",
        &err.to_string(),
        serde_json::json!({
            "subcommand": subcommand.as_str(),
            "attempt": attempt,
            "exit_code": err.log().and_then(|log| log.exit_code),
        }),
    );
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Captured {
    fn push(&mut self, (stream, chunk): (Stream, Vec<u8>)) {
        match stream {
            Stream::Stdout => self.stdout.extend_from_slice(&chunk),
            Stream::Stderr => self.stderr.extend_from_slice(&chunk),
        }
    }

    fn drain_ready(&mut self, rx: &Receiver<(Stream, Vec<u8>)>) {
        while let Ok(msg) = rx.try_recv() {
            self.push(msg);
        }
    }

    fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: Stream,
    tx: Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_command: &mut Command) {}

/// Kills the child and everything it spawned into its process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
    }
    let _ = child.kill();
}

fn run_once(
    options: &Options,
    spec: &InvocationSpec,
    attempt: u32,
) -> Result<CommandOutput, TerraformError> {
    let cwd = &options.terraform_dir;
    let base_log = InvocationLog {
        subcommand: spec.subcommand,
        command_form: spec.command_form(),
        working_directory: cwd.clone(),
        exit_code: None,
        attempts: attempt,
        timed_out: false,
    };

    let mut command = Command::new(&spec.binary);
    command
        .current_dir(cwd)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut command);

    for (k, v) in &spec.env {
        command.env(k, v);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TerraformError::MissingBinary {
                subcommand: spec.subcommand,
                binary: spec.binary.clone(),
                log: Box::new(base_log),
            })
        }
        Err(err) => return Err(io_error(cwd, err)),
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io_error(cwd, std::io::Error::other("missing stdout pipe")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io_error(cwd, std::io::Error::other("missing stderr pipe")))?;

    let (tx, rx) = mpsc::channel();
    spawn_reader(stdout, Stream::Stdout, tx.clone());
    spawn_reader(stderr, Stream::Stderr, tx);

    let mut captured = Captured::default();
    let start = Instant::now();
    let exit_status = loop {
        captured.drain_ready(&rx);
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > options.timeout {
                    kill_tree(&mut child);
                    let status = child.wait().map_err(|e| io_error(cwd, e))?;
                    // Pipes may still be held open by an orphan; stop waiting after the grace period.
                    let deadline = Instant::now() + KILL_GRACE;
                    loop {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        match rx.recv_timeout(remaining) {
                            Ok(msg) => captured.push(msg),
                            Err(_) => break,
                        }
                    }
                    let (stdout, stderr) = captured.into_strings();
                    let mut log = base_log;
                    log.timed_out = true;
                    log.exit_code = status.code();
                    return Err(TerraformError::Timeout {
                        subcommand: spec.subcommand,
                        timeout_ms: options.timeout.as_millis() as u64,
                        stdout,
                        stderr,
                        log: Box::new(log),
                    });
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => return Err(io_error(cwd, err)),
        }
    };

    for msg in rx {
        captured.push(msg);
    }
    let (stdout, stderr) = captured.into_strings();

    let mut log = base_log;
    log.exit_code = exit_status.code();
    if !exit_status.success() {
        return Err(TerraformError::NonZeroExit {
            subcommand: spec.subcommand,
            exit_code: exit_status.code().unwrap_or(-1),
            stdout,
            stderr,
            log: Box::new(log),
        });
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        log,
    })
}

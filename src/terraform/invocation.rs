use crate::terraform::{InvocationSpec, Options, Subcommand};
use std::collections::BTreeMap;

pub fn build_invocation(options: &Options, subcommand: Subcommand) -> InvocationSpec {
    let mut args = vec![subcommand.as_str().to_string()];
    match subcommand {
        Subcommand::Init => {
            args.push("-input=false".to_string());
            if options.upgrade {
                args.push("-upgrade".to_string());
            }
            if options.reconfigure {
                args.push("-reconfigure".to_string());
            }
            push_lock_args(options, &mut args);
            for (key, value) in &options.backend_config {
                args.push(format!("-backend-config={key}={value}"));
            }
        }
        Subcommand::Apply => {
            args.push("-input=false".to_string());
            args.push("-auto-approve".to_string());
            push_lock_args(options, &mut args);
            push_parallelism(options, &mut args);
            push_var_args(options, &mut args);
        }
        Subcommand::Destroy => {
            args.push("-auto-approve".to_string());
            args.push("-input=false".to_string());
            push_lock_args(options, &mut args);
            push_parallelism(options, &mut args);
            push_var_args(options, &mut args);
        }
        Subcommand::Output => {
            args.push("-json".to_string());
        }
    }
    if options.no_color {
        args.push("-no-color".to_string());
    }

    let mut env = BTreeMap::new();
    env.insert("TF_IN_AUTOMATION".to_string(), "1".to_string());
    env.insert("TF_INPUT".to_string(), "0".to_string());
    for (key, value) in &options.env_vars {
        env.insert(key.clone(), value.clone());
    }

    InvocationSpec {
        subcommand,
        binary: options.terraform_binary.clone(),
        args,
        env,
    }
}

fn push_lock_args(options: &Options, args: &mut Vec<String>) {
    if let Some(lock) = options.lock {
        args.push(format!("-lock={lock}"));
    }
    if let Some(timeout) = &options.lock_timeout {
        args.push(format!("-lock-timeout={timeout}"));
    }
}

fn push_parallelism(options: &Options, args: &mut Vec<String>) {
    if let Some(parallelism) = options.parallelism {
        args.push(format!("-parallelism={parallelism}"));
    }
}

fn push_var_args(options: &Options, args: &mut Vec<String>) {
    for (key, value) in &options.vars {
        args.push("-var".to_string());
        args.push(format!("{key}={}", format_var_value(value)));
    }
    for file in &options.var_files {
        args.push(format!("-var-file={}", file.display()));
    }
}

// Strings go through verbatim; everything else uses HCL-compatible JSON.
fn format_var_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(raw) => raw.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

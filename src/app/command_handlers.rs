use crate::app::cli::{help_text, parse_cli_verb, parse_flags, CliFlags, CliVerb};
use crate::config::{load_harness_config, HarnessConfig};
use crate::terraform::{
    destroy, init_and_apply, output, parse_resource_count, with_infrastructure, CommandOutput,
    Options, Subcommand,
};
use crate::workspace::copy_module_to_temp;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Apply => cmd_apply(&args[1..]),
        CliVerb::Destroy => cmd_destroy(&args[1..]),
        CliVerb::Cycle => cmd_cycle(&args[1..]),
        CliVerb::Output => cmd_output(&args[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`\n\n{}", args[0], help_text())),
    }
}

fn load_config(flags: &CliFlags) -> Result<HarnessConfig, String> {
    let mut config = load_harness_config(flags.config.as_deref()).map_err(|e| e.to_string())?;
    if let Some(dir) = &flags.terraform_dir {
        config.terraform_dir = dir.clone();
    }
    Ok(config)
}

fn load_options(args: &[String]) -> Result<(HarnessConfig, Options), String> {
    let flags = parse_flags(args)?;
    let config = load_config(&flags)?;
    let options = config.to_options();
    options.validate().map_err(|e| e.to_string())?;
    Ok((config, options))
}

fn summarize(subcommand: Subcommand, out: &CommandOutput) -> String {
    match parse_resource_count(subcommand, &out.stdout) {
        Ok(count) => format!(
            "{} complete: {} added, {} changed, {} destroyed",
            subcommand, count.added, count.changed, count.destroyed
        ),
        Err(_) => format!("{subcommand} complete"),
    }
}

pub fn cmd_apply(args: &[String]) -> Result<String, String> {
    let (_, options) = load_options(args)?;
    let out = init_and_apply(&options).map_err(|e| e.to_string())?;
    Ok(format!("{}\n{}", out.stdout.trim_end(), summarize(Subcommand::Apply, &out)))
}

pub fn cmd_destroy(args: &[String]) -> Result<String, String> {
    let (_, options) = load_options(args)?;
    let out = destroy(&options).map_err(|e| e.to_string())?;
    Ok(format!("{}\n{}", out.stdout.trim_end(), summarize(Subcommand::Destroy, &out)))
}

pub fn cmd_output(args: &[String]) -> Result<String, String> {
    let (_, options) = load_options(args)?;
    let outputs = output(&options).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&outputs).map_err(|e| e.to_string())
}

/// Full apply/destroy lifecycle, in a private copy of the module when
/// isolation is enabled.
pub fn cmd_cycle(args: &[String]) -> Result<String, String> {
    let (config, mut options) = load_options(args)?;
    let isolated = if config.isolate {
        Some(copy_module_to_temp(&options.terraform_dir).map_err(|e| e.to_string())?)
    } else {
        None
    };
    if let Some(module) = &isolated {
        options.terraform_dir = module.path().to_path_buf();
    }

    let applied = with_infrastructure(&options, |out| {
        Ok::<_, String>(summarize(Subcommand::Apply, out))
    })
    .map_err(|e| e.to_string())?;
    Ok(format!("{applied}\ndestroy complete"))
}

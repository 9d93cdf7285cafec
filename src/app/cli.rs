use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Apply,
    Destroy,
    Cycle,
    Output,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "apply" => CliVerb::Apply,
        "destroy" => CliVerb::Destroy,
        "cycle" => CliVerb::Cycle,
        "output" => CliVerb::Output,
        "help" | "-h" | "--help" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: terraform-aws-mfa <command> [--config <file>] [<terraform_dir>]".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  apply      Run terraform init and apply against the root module".to_string(),
        "  destroy    Run terraform destroy against the root module".to_string(),
        "  cycle      Apply then destroy; destroy runs even when apply fails".to_string(),
        "  output     Print terraform outputs as JSON".to_string(),
        "  help       Show this message".to_string(),
    ]
}

pub fn help_text() -> String {
    cli_help_lines().join("\n")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliFlags {
    pub config: Option<PathBuf>,
    pub terraform_dir: Option<PathBuf>,
}

pub fn parse_flags(args: &[String]) -> Result<CliFlags, String> {
    let mut flags = CliFlags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "`--config` requires a file path".to_string())?;
                flags.config = Some(PathBuf::from(value));
            }
            other if other.starts_with("--config=") => {
                flags.config = Some(PathBuf::from(&other["--config=".len()..]));
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown flag `{other}`"));
            }
            other => {
                if flags.terraform_dir.is_some() {
                    return Err(format!("unexpected argument `{other}`"));
                }
                flags.terraform_dir = Some(PathBuf::from(other));
            }
        }
    }
    Ok(flags)
}

use crate::terraform::{Subcommand, TerraformError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputValue {
    #[serde(default)]
    pub sensitive: bool,
    #[serde(rename = "type", default)]
    pub value_type: Value,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCount {
    pub added: u32,
    pub changed: u32,
    pub destroyed: u32,
}

pub fn parse_output_json(stdout: &str) -> Result<BTreeMap<String, OutputValue>, TerraformError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(TerraformError::ParseFailure {
            subcommand: Subcommand::Output,
            reason: "stdout was empty".to_string(),
        });
    }
    serde_json::from_str(trimmed).map_err(|err| TerraformError::ParseFailure {
        subcommand: Subcommand::Output,
        reason: format!("invalid output json: {err}"),
    })
}

static ANSI_ESCAPE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static APPLY_SUMMARY: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static DESTROY_SUMMARY: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn cached(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
    subcommand: Subcommand,
) -> Result<&'static Regex, TerraformError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|err| parse_failure(subcommand, err.to_string()))
}

fn capture_u32(caps: &regex::Captures<'_>, index: usize) -> u32 {
    caps.get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Reads the resource summary line printed at the end of apply or destroy.
pub fn parse_resource_count(
    subcommand: Subcommand,
    stdout: &str,
) -> Result<ResourceCount, TerraformError> {
    let ansi = cached(&ANSI_ESCAPE, r"\x1b\[[0-9;?]*[A-Za-z]", subcommand)?;
    let apply = cached(
        &APPLY_SUMMARY,
        r"Apply complete! Resources: (\d+) added, (\d+) changed, (\d+) destroyed\.",
        subcommand,
    )?;
    let destroy = cached(
        &DESTROY_SUMMARY,
        r"Destroy complete! Resources: (\d+) destroyed\.",
        subcommand,
    )?;
    let clean = ansi.replace_all(stdout, "");

    if let Some(caps) = apply.captures_iter(&clean).last() {
        return Ok(ResourceCount {
            added: capture_u32(&caps, 1),
            changed: capture_u32(&caps, 2),
            destroyed: capture_u32(&caps, 3),
        });
    }
    if let Some(caps) = destroy.captures_iter(&clean).last() {
        return Ok(ResourceCount {
            destroyed: capture_u32(&caps, 1),
            ..ResourceCount::default()
        });
    }
    Err(parse_failure(
        subcommand,
        "no resource summary line found".to_string(),
    ))
}

fn parse_failure(subcommand: Subcommand, reason: String) -> TerraformError {
    TerraformError::ParseFailure { subcommand, reason }
}

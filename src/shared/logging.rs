use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Appends one JSON line to the harness log. Failures to log are swallowed.
pub fn append_harness_log(
    path: Option<&Path>,
    level: LogLevel,
    event: &str,
    message: &str,
    fields: serde_json::Value,
) {
    let Some(path) = path else {
        return;
    };

    let mut payload = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "level": level.as_str(),
        "event": event,
        "message": message,
    });
    if !fields.is_null() {
        payload["fields"] = fields;
    }

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::tempdir;

    #[test]
    fn appends_json_lines_with_fields() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("logs/harness.log");

        append_harness_log(
            Some(&path),
            LogLevel::Info,
            "command.start",
            "terraform init",
            serde_json::json!({"attempt": 1}),
        );
        append_harness_log(
            Some(&path),
            LogLevel::Warn,
            "command.retry",
            "throttled",
            Value::Null,
        );

        let raw = fs::read_to_string(&path).expect("read log");
        let lines: Vec<Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "command.start");
        assert_eq!(lines[0]["fields"]["attempt"], 1);
        assert_eq!(lines[1]["level"], "warn");
        assert!(lines[1].get("fields").is_none());
    }

    #[test]
    fn missing_path_is_a_no_op() {
        append_harness_log(None, LogLevel::Error, "noop", "ignored", Value::Null);
    }
}

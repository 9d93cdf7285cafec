#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("harness config validation failed: {0}")]
    Harness(String),
    #[error("failed to resolve current directory: {0}")]
    CurrentDir(#[source] std::io::Error),
}

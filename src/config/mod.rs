pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_harness_config, load_harness_config_with, BINARY_ENV, CONFIG_PATH_ENV};
pub use settings::{HarnessConfig, DEFAULT_TERRAFORM_DIR};

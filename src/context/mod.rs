use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use store::{CreateOptions, StoreFormat, DEFAULT_CHUNK_SIZE};
use util::RetryPolicy;
use workflow::Environment;

/// Rule evaluation
mod evaluator;
pub use evaluator::{cast_value, BasicEvaluator, ConditionEvaluator};

/// Reading workflow templates
mod loader;
pub use loader::{JsonTemplateLoader, TemplateLoader};

/// Handing jobscripts to a scheduler
mod submitter;
pub use submitter::{JobscriptSubmitter, RecordingSubmitter, SubmittedJobscript};

/// Contents of the optional JSON config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Format used for newly created workflows.
    pub store_format: StoreFormat,
    /// Items per chunk in the chunked format.
    pub chunk_size: usize,
    pub io_retry: RetryPolicy,
    pub environments: Vec<Environment>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_format: StoreFormat::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            io_retry: RetryPolicy::default(),
            environments: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Everything a workflow borrows from its caller: configuration,
/// the environments actions run in, and the rule evaluator.
pub struct Context {
    pub config: Config,
    evaluator: Box<dyn ConditionEvaluator>,
}

impl Context {
    pub fn new(config: Config, evaluator: Box<dyn ConditionEvaluator>) -> Self {
        Self { config, evaluator }
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.config.environments.iter().find(|e| e.name == name)
    }

    pub fn evaluator(&self) -> &dyn ConditionEvaluator {
        self.evaluator.as_ref()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.config.io_retry
    }

    pub fn create_options(&self, overwrite: bool) -> CreateOptions {
        CreateOptions {
            format: self.config.store_format,
            chunk_size: self.config.chunk_size,
            retry: self.config.io_retry,
            overwrite,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Config::default(), Box::new(BasicEvaluator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_fields_take_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"store_format": "chunked", "io_retry": {{"max_attempts": 2}},
                "environments": [{{"name": "python_env"}}]}}"#
        )?;
        let config = Config::load(file.path())?;
        assert_eq!(config.store_format, StoreFormat::Chunked);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.io_retry.max_attempts, 2);
        assert_eq!(config.io_retry.initial_delay_ms, 50);

        let ctx = Context::new(config, Box::new(BasicEvaluator));
        assert!(ctx.environment("python_env").is_some());
        assert!(ctx.environment("matlab_env").is_none());
        Ok(())
    }
}

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde_json::Value;

use crate::args::{Args, Command, InternalCall, JobscriptCell};
use crate::context::Config;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Config file {0:?} does not exist")]
    MissingConfig(PathBuf),
}

/// What the user asked for, with paths resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Make {
        template: PathBuf,
        path: Option<PathBuf>,
        name: Option<String>,
        overwrite: bool,
    },
    Show(PathBuf),
    Jobscripts(PathBuf),
    Prepare(PathBuf),
    Submit(PathBuf),
    InitEars(PathBuf),
    EarStart(PathBuf, JobscriptCell),
    EarEnd(PathBuf, JobscriptCell),
    SaveParameter {
        workflow: PathBuf,
        name: String,
        value: Value,
        cell: JobscriptCell,
    },
}

/// Settings are like Args, except all the logic has
/// been applied so e.g. defaults are added in.
#[derive(Debug)]
pub struct Settings {
    pub config: Config,
    pub yes: bool,
    pub verbose: u8,
    pub action: Action,
}

impl TryFrom<Args> for Settings {
    type Error = anyhow::Error;
    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let mut config = match &args.config {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(Error::MissingConfig(path).into());
                }
                Config::load(&path)?
            }
            None => Config::default(),
        };

        let action = match args.command {
            Command::Make {
                template,
                path,
                name,
                overwrite,
                store,
            } => {
                if let Some(format) = store {
                    config.store_format = format
                        .parse()
                        .with_context(|| format!("while reading --store \"{format}\""))?;
                }
                Action::Make {
                    template: PathBuf::from(template),
                    path: path.map(PathBuf::from),
                    name,
                    overwrite,
                }
            }
            Command::Show { workflow } => Action::Show(workflow.into()),
            Command::Jobscripts { workflow } => Action::Jobscripts(workflow.into()),
            Command::Prepare { workflow } => Action::Prepare(workflow.into()),
            Command::Submit { workflow } => Action::Submit(workflow.into()),
            Command::InitEars { workflow } => Action::InitEars(workflow.into()),
            Command::Internal { workflow, call } => {
                let workflow = PathBuf::from(workflow);
                match call {
                    InternalCall::EarStart(cell) => Action::EarStart(workflow, cell),
                    InternalCall::EarEnd(cell) => Action::EarEnd(workflow, cell),
                    InternalCall::SaveParameter { name, value, cell } => Action::SaveParameter {
                        workflow,
                        name,
                        value: parse_value(&value),
                        cell,
                    },
                }
            }
        };

        Ok(Self {
            config,
            yes: args.yes,
            verbose: args.verbose,
            action,
        })
    }
}

/// A command-line parameter value: JSON if it parses, otherwise a plain string.
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;
    use store::StoreFormat;

    #[test]
    fn values_fall_back_to_strings() {
        assert_eq!(parse_value("3.5"), json!(3.5));
        assert_eq!(parse_value("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_value("\"quoted\""), json!("quoted"));
        assert_eq!(parse_value("plain text"), json!("plain text"));
    }

    #[test]
    fn store_flag_overrides_config() -> Result<()> {
        let args = Args::parse_from(["jf", "make", "t.json", "--store", "chunked"]);
        let settings = Settings::try_from(args)?;
        assert_eq!(settings.config.store_format, StoreFormat::Chunked);
        assert!(matches!(settings.action, Action::Make { overwrite: false, .. }));

        let args = Args::parse_from(["jf", "make", "t.json", "--store", "yaml"]);
        assert!(Settings::try_from(args).is_err());
        Ok(())
    }

    #[test]
    fn missing_config_is_an_error() {
        let args = Args::parse_from(["jf", "-c", "/no/such/config.json", "show", "wf"]);
        let err = Settings::try_from(args).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::MissingConfig(_))));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::param::root_param;
use crate::resources::{SCOPE_ANY, SCOPE_MAIN, SCOPE_PROCESSING};

const PARAMETER_REF: &str = "parameter";
const EXECUTABLE_REF: &str = "executable";

/// Declares the inputs, outputs, and actions of one way of achieving an objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSchema {
    pub objective: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(default)]
    pub inputs: Vec<SchemaInput>,
    #[serde(default)]
    pub outputs: Vec<SchemaOutput>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl TaskSchema {
    /// e.g. `simulate_fast_gpu` for objective `simulate`, method `fast`, implementation `gpu`.
    pub fn name(&self) -> String {
        let mut name = self.objective.clone();
        for part in [&self.method, &self.implementation].into_iter().flatten() {
            name.push('_');
            name.push_str(part);
        }
        name
    }

    pub fn input(&self, param: &str) -> Option<&SchemaInput> {
        self.inputs.iter().find(|i| i.parameter == param)
    }

    pub fn has_output(&self, param: &str) -> bool {
        self.outputs.iter().any(|o| o.parameter == param)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInput {
    pub parameter: String,
    /// Used when no other source is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// When set, this input receives every element of the named group of its
    /// upstream source task at once, rather than one element per downstream element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaOutput {
    pub parameter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// One step of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub commands: Vec<Command>,
    /// Script actions consume every schema input and produce every schema output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Label of the input file this action generates, if it is an input file generator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file_generator: Option<String>,
    /// Output parameter this action parses from files, if it is an output file parser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_parser: Option<String>,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ActionRule>,
    /// Names of environments this action runs in.
    #[serde(default)]
    pub environments: Vec<String>,
}

impl Action {
    pub fn scope(&self) -> ActionScope {
        if let Some(file) = &self.input_file_generator {
            ActionScope::InputFileGenerator(file.clone())
        } else if let Some(output) = &self.output_file_parser {
            ActionScope::OutputFileParser(output.clone())
        } else {
            ActionScope::Main
        }
    }

    /// Names of the parameters this action reads, in order of first use.
    /// A sub-parameter reference like `p1.a` reads all of `p1`.
    pub fn input_types(&self, schema: &TaskSchema) -> Vec<String> {
        if self.script.is_some() || self.input_file_generator.is_some() {
            return schema.inputs.iter().map(|i| i.parameter.clone()).collect();
        }
        let mut types = Vec::new();
        for cmd in &self.commands {
            for name in references(&cmd.command, PARAMETER_REF) {
                push_unique(&mut types, root_param(name));
            }
        }
        types
    }

    /// Names of the parameters this action writes.
    pub fn output_types(&self, schema: &TaskSchema) -> Vec<String> {
        if self.script.is_some() {
            return schema.outputs.iter().map(|o| o.parameter.clone()).collect();
        }
        let mut types = Vec::new();
        if let Some(output) = &self.output_file_parser {
            push_unique(&mut types, output);
        }
        for cmd in &self.commands {
            for stream in [&cmd.stdout, &cmd.stderr].into_iter().flatten() {
                for name in references(stream, PARAMETER_REF) {
                    push_unique(&mut types, name);
                }
            }
        }
        types
    }

    /// Labels of the executables referenced by this action's commands.
    pub fn executables(&self) -> Vec<String> {
        let mut labels = Vec::new();
        for cmd in &self.commands {
            for name in references(&cmd.command, EXECUTABLE_REF) {
                push_unique(&mut labels, name);
            }
        }
        labels
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n == name) {
        list.push(name.to_owned());
    }
}

/// Find every `<<kind:NAME>>` in `text`, yielding `NAME`.
fn references<'a>(text: &'a str, kind: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    let mut rest = text;
    std::iter::from_fn(move || loop {
        let start = rest.find("<<")?;
        let after = &rest[start + 2..];
        let end = after.find(">>")?;
        let inner = &after[..end];
        rest = &after[end + 2..];
        if let Some((k, name)) = inner.split_once(':') {
            if k == kind && !name.is_empty() {
                return Some(name);
            }
        }
    })
}

/// Which resource scopes apply to an action, most specific first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionScope {
    Main,
    InputFileGenerator(String),
    OutputFileParser(String),
}

impl ActionScope {
    pub fn key(&self) -> String {
        match self {
            Self::Main => SCOPE_MAIN.to_owned(),
            Self::InputFileGenerator(file) => format!("input_file_generator[file={file}]"),
            Self::OutputFileParser(output) => format!("output_file_parser[output={output}]"),
        }
    }

    pub fn resource_scopes(&self) -> Vec<String> {
        let mut scopes = vec![self.key()];
        if !matches!(self, Self::Main) {
            scopes.push(SCOPE_PROCESSING.to_owned());
        }
        scopes.push(SCOPE_ANY.to_owned());
        scopes
    }
}

/// Decides whether an action runs for a given iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRule {
    /// True if the path is present in the iteration's data index.
    CheckExists(String),
    /// True if the path is absent from the iteration's data index.
    CheckMissing(String),
    /// True if the value at `path` satisfies the predicate.
    Condition(Condition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<Cast>,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cast {
    Str,
    Int,
    Float,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Equal(Value),
    NotEqual(Value),
    LessThan(f64),
    GreaterThan(f64),
    In(Vec<Value>),
    IsTrue,
}

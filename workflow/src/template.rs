use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ActionRule, InsertId, IterIdx, ResourceSpec, TaskSchema};

/// Raw workflow definition, as produced by a template loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
    #[serde(default)]
    pub loops: Vec<LoopTemplate>,
    /// Workflow-wide resources; used wherever an element set does not say otherwise.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub schemas: Vec<TaskSchema>,
    #[serde(default)]
    pub element_sets: Vec<ElementSet>,
    /// Named groups of this task's elements, for grouped inputs downstream.
    #[serde(default)]
    pub groups: Vec<ElementGroup>,
}

/// A named selection of a task's elements. Written either as just the name,
/// which selects every element, or in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "GroupRepr")]
pub struct ElementGroup {
    pub name: String,
    /// Rules an element's latest iteration must pass to be a member.
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<ActionRule>,
    /// Split the members by the value at this path, e.g. `inputs.p1`;
    /// downstream gets one grouped input per distinct value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by_distinct: Option<String>,
}

impl ElementGroup {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            filter: Vec::new(),
            group_by_distinct: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GroupRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default, rename = "where")]
        filter: Vec<ActionRule>,
        #[serde(default)]
        group_by_distinct: Option<String>,
    },
}

impl From<GroupRepr> for ElementGroup {
    fn from(repr: GroupRepr) -> Self {
        match repr {
            GroupRepr::Name(name) => Self::named(&name),
            GroupRepr::Full {
                name,
                filter,
                group_by_distinct,
            } => Self {
                name,
                filter,
                group_by_distinct,
            },
        }
    }
}

impl TaskTemplate {
    pub fn objective(&self) -> Option<&str> {
        self.schemas.first().map(|s| s.objective.as_str())
    }
}

/// One parametrisation of a task. Every element set expands into one or more elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSet {
    #[serde(default)]
    pub inputs: Vec<InputValue>,
    #[serde(default)]
    pub sequences: Vec<ValueSequence>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    /// Explicit sources per input parameter; the first entry is used.
    #[serde(default)]
    pub input_sources: BTreeMap<String, Vec<InputSource>>,
    /// Nesting orders per path, for paths whose values are not sequences.
    #[serde(default)]
    pub nesting_order: BTreeMap<String, f64>,
    /// Restricts upstream sources to these iterations of their tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sourceable_elem_iters: Option<BTreeMap<InsertId, Vec<IterIdx>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputValue {
    pub parameter: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSequence {
    /// e.g. `inputs.p1`
    pub path: String,
    pub values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nesting_order: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSourceType {
    #[default]
    Output,
    Input,
}

/// Where an input's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    Local,
    Default,
    Task {
        task: InsertId,
        #[serde(default)]
        source_type: TaskSourceType,
    },
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Default => write!(f, "default"),
            Self::Task { task, source_type } => {
                let ty = match source_type {
                    TaskSourceType::Output => "output",
                    TaskSourceType::Input => "input",
                };
                write!(f, "task.{task}.{ty}")
            }
        }
    }
}

/// Describes how new elements of an upstream task flow into a downstream task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementPropagation {
    pub task: InsertId,
    #[serde(default)]
    pub nesting_order: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopTemplate {
    pub name: String,
    pub tasks: Vec<InsertId>,
    pub num_iterations: u32,
}

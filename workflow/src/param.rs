use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ActionIdx, EarIdx, ElementIdx, InsertId, IterIdx, ParamId};

/// Mapping from normalised parameter path (e.g. `inputs.p1`) to parameter indices.
pub type DataIdx = BTreeMap<String, ParamRef>;

pub const INPUTS: &str = "inputs";
pub const OUTPUTS: &str = "outputs";
pub const RESOURCES: &str = "resources";
pub const INPUT_FILES: &str = "input_files";
pub const OUTPUT_FILES: &str = "output_files";

pub fn input_path(param: &str) -> String {
    format!("{INPUTS}.{param}")
}

pub fn output_path(param: &str) -> String {
    format!("{OUTPUTS}.{param}")
}

pub fn resource_path(scope: &str) -> String {
    format!("{RESOURCES}.{scope}")
}

pub fn input_file_path(label: &str) -> String {
    format!("{INPUT_FILES}.{label}")
}

pub fn output_file_path(label: &str) -> String {
    format!("{OUTPUT_FILES}.{label}")
}

/// Split `inputs.p1` into `("inputs", "p1")`.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    path.split_once('.')
}

/// The parameter a sub-parameter belongs to: `p1` for `p1.a.b`.
pub fn root_param(param: &str) -> &str {
    param.split_once('.').map_or(param, |(root, _)| root)
}

/// Look up a dotted path inside a value. Array elements are addressed by index.
pub fn get_in<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |val, seg| match val {
        Value::Object(map) => map.get(*seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set `sub` at a dotted path inside `value`, replacing anything in the way
/// that cannot hold a child.
pub fn set_in(value: &mut Value, path: &[&str], sub: Value) {
    let target = path.iter().fold(value, |cur, seg| child_mut(cur, seg));
    *target = sub;
}

fn child_mut<'a>(value: &'a mut Value, seg: &str) -> &'a mut Value {
    let index = match &*value {
        Value::Array(items) => seg.parse::<usize>().ok().filter(|&i| i < items.len()),
        _ => None,
    };
    if index.is_none() && !value.is_object() {
        *value = Value::Object(serde_json::Map::new());
    }
    match (value, index) {
        (Value::Array(items), Some(i)) => &mut items[i],
        (Value::Object(map), _) => map.entry(seg.to_owned()).or_insert(Value::Null),
        (other, _) => other,
    }
}

/// The stored value of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ParamData {
    /// Placeholder for a value that will be produced later.
    Unset,
    Set(Value),
}

impl ParamData {
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Set(val) => Some(val),
            Self::Unset => None,
        }
    }
}

/// Reference from a data index to one parameter, or to several
/// when an input is sourced from a group of upstream elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamRef {
    One(ParamId),
    Many(Vec<ParamId>),
}

impl ParamRef {
    pub fn ids(&self) -> &[ParamId] {
        match self {
            Self::One(id) => std::slice::from_ref(id),
            Self::Many(ids) => ids,
        }
    }
}

impl From<ParamId> for ParamRef {
    fn from(id: ParamId) -> Self {
        Self::One(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "local_input")]
    LocalInput,
    #[serde(rename = "default_input")]
    DefaultInput,
    #[serde(rename = "EAR_output")]
    EarOutput,
    #[serde(rename = "workflow_resources")]
    WorkflowResources,
}

/// Provenance of a parameter.
///
/// Output sources are created before the producing EAR exists, with only the
/// task/element/iteration filled in; a [`SourcePatch`] completes them later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamSource {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_insert_id: Option<InsertId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_idx: Option<ElementIdx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_idx: Option<IterIdx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_idx: Option<ActionIdx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_idx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ear_idx: Option<EarIdx>,
}

impl ParamSource {
    fn new(kind: SourceKind, task_insert_id: Option<InsertId>) -> Self {
        Self {
            kind,
            task_insert_id,
            element_idx: None,
            iteration_idx: None,
            action_idx: None,
            run_idx: None,
            ear_idx: None,
        }
    }

    pub fn local_input(task: InsertId) -> Self {
        Self::new(SourceKind::LocalInput, Some(task))
    }

    pub fn default_input(task: InsertId) -> Self {
        Self::new(SourceKind::DefaultInput, Some(task))
    }

    pub fn workflow_resources() -> Self {
        Self::new(SourceKind::WorkflowResources, None)
    }

    /// Placeholder source for an output reserved at iteration creation.
    pub fn iteration_output(task: InsertId, element: ElementIdx, iteration: IterIdx) -> Self {
        let mut src = Self::new(SourceKind::EarOutput, Some(task));
        src.element_idx = Some(element);
        src.iteration_idx = Some(iteration);
        src
    }

    pub fn apply(&mut self, patch: &SourcePatch) {
        self.action_idx = Some(patch.action_idx);
        self.run_idx = Some(patch.run_idx);
        self.ear_idx = Some(patch.ear_idx);
    }

    /// The EAR that produces this parameter, once known.
    pub fn originating_ear(&self) -> Option<(InsertId, EarIdx)> {
        match (self.kind, self.task_insert_id, self.ear_idx) {
            (SourceKind::EarOutput, Some(task), Some(ear)) => Some((task, ear)),
            _ => None,
        }
    }
}

/// Completes an output source once its producing EAR has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePatch {
    pub action_idx: ActionIdx,
    pub run_idx: u32,
    pub ear_idx: EarIdx,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn output_placeholder_has_no_originating_ear_until_patched() {
        let mut src = ParamSource::iteration_output(InsertId::new(2), ElementIdx::new(0), IterIdx::new(0));
        assert_eq!(src.originating_ear(), None);
        src.apply(&SourcePatch {
            action_idx: ActionIdx::new(1),
            run_idx: 0,
            ear_idx: EarIdx::new(4),
        });
        assert_eq!(src.originating_ear(), Some((InsertId::new(2), EarIdx::new(4))));
    }

    #[test]
    fn source_json_omits_missing_indices() -> Result<()> {
        let json = serde_json::to_string(&ParamSource::local_input(InsertId::new(3)))?;
        assert_eq!(json, r#"{"type":"local_input","task_insert_id":3}"#);
        let back: ParamSource = serde_json::from_str(&json)?;
        assert_eq!(back.kind, SourceKind::LocalInput);
        Ok(())
    }

    #[test]
    fn sub_paths_read_and_write_nested_values() {
        let mut val = serde_json::json!({"a": {"b": [1, 2]}, "c": 3});
        assert_eq!(get_in(&val, &["a", "b", "1"]), Some(&serde_json::json!(2)));
        assert_eq!(get_in(&val, &["c", "d"]), None);

        set_in(&mut val, &["a", "b", "0"], serde_json::json!(10));
        set_in(&mut val, &["c", "d"], serde_json::json!(4));
        set_in(&mut val, &["e", "f"], serde_json::json!(5));
        assert_eq!(
            val,
            serde_json::json!({"a": {"b": [10, 2]}, "c": {"d": 4}, "e": {"f": 5}})
        );
        assert_eq!(root_param("p1.a.b"), "p1");
        assert_eq!(root_param("p1"), "p1");
    }

    #[test]
    fn param_ref_is_untagged() -> Result<()> {
        let one: ParamRef = serde_json::from_str("7")?;
        let many: ParamRef = serde_json::from_str("[1,2]")?;
        assert_eq!(one.ids(), &[ParamId::new(7)]);
        assert_eq!(many.ids().len(), 2);
        Ok(())
    }
}

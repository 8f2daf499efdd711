use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SCOPE_ANY: &str = "any";
pub const SCOPE_MAIN: &str = "main";
pub const SCOPE_PROCESSING: &str = "processing";

const NUM_CORES: &str = "num_cores";
const PARALLEL_MODE: &str = "parallel_mode";

fn default_scope() -> String {
    SCOPE_ANY.to_owned()
}

/// Resource requirements declared in a template, for one action scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

impl ResourceSpec {
    pub fn any() -> Self {
        Self {
            scope: default_scope(),
            settings: BTreeMap::new(),
        }
    }

    /// Value stored in the parameter store for this spec.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.settings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Resolved resources for a single EAR.
///
/// Two EARs share a resource group iff these compare equal; keys are kept sorted
/// so the JSON form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, Value>);

impl Resources {
    /// Fill in any settings from `settings` that are not already present.
    pub fn fill_from(&mut self, settings: &Map<String, Value>) {
        for (k, v) in settings {
            self.0.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, val: Value) {
        self.0.insert(key.to_owned(), val);
    }

    pub fn num_cores(&self) -> u32 {
        self.0
            .get(NUM_CORES)
            .and_then(Value::as_u64)
            .map_or(1, |n| n as u32)
    }

    pub fn parallel_mode(&self) -> Option<&str> {
        self.0.get(PARALLEL_MODE).and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;

    #[test]
    fn spec_flattens_settings() -> Result<()> {
        let spec: ResourceSpec = serde_json::from_value(json!({"scope": "main", "num_cores": 4}))?;
        assert_eq!(spec.scope, "main");
        assert_eq!(spec.to_value(), json!({"num_cores": 4}));

        let spec: ResourceSpec = serde_json::from_value(json!({"num_cores": 2}))?;
        assert_eq!(spec.scope, SCOPE_ANY);
        Ok(())
    }

    #[test]
    fn fill_keeps_more_specific_values() {
        let mut res = Resources::default();
        res.insert("num_cores", json!(8));
        let general = json!({"num_cores": 1, "scheduler": "slurm"});
        res.fill_from(general.as_object().unwrap());
        assert_eq!(res.num_cores(), 8);
        assert_eq!(res.get("scheduler"), Some(&json!("slurm")));
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use util::IdVec;
use workflow::{
    ElementGroup, ElementSet, Error as WorkflowError, InsertId, Loop, ParamData, ParamId,
    ParamSource, ResourceSpec, Submission, TaskRecords, TaskSchema,
};

/// A task as stored in the template document; schemas are referenced by content key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTask {
    pub insert_id: InsertId,
    /// Unique within the workflow.
    pub name: String,
    pub schemas: Vec<String>,
    pub element_sets: Vec<ElementSet>,
    #[serde(default)]
    pub groups: Vec<ElementGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateDoc {
    pub name: String,
    pub tasks: Vec<StoredTask>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Shared definitions, deduplicated by content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateComponents {
    pub parameters: BTreeSet<String>,
    pub task_schemas: BTreeMap<String, TaskSchema>,
}

/// Everything persisted about a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDoc {
    pub template: TemplateDoc,
    pub components: TemplateComponents,
    /// Total tasks ever added; the next insert ID.
    pub num_added_tasks: u32,
    /// Parallel to `template.tasks`.
    pub tasks: Vec<TaskRecords>,
    pub loops: Vec<Loop>,
    pub parameters: IdVec<ParamId, ParamData>,
    /// Parallel to `parameters`.
    pub sources: IdVec<ParamId, ParamSource>,
    pub submissions: Vec<Submission>,
    /// Directory this workflow replaced at creation, until creation commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_dir: Option<PathBuf>,
}

impl WorkflowDoc {
    pub fn new(name: &str) -> Self {
        Self {
            template: TemplateDoc {
                name: name.to_owned(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Position of the task with `insert_id` in the task list.
    pub fn task_position(&self, insert_id: InsertId) -> Result<usize> {
        self.template
            .tasks
            .iter()
            .position(|t| t.insert_id == insert_id)
            .ok_or_else(|| WorkflowError::UnknownTask(insert_id).into())
    }

    pub fn task(&self, insert_id: InsertId) -> Result<(&StoredTask, &TaskRecords)> {
        let pos = self.task_position(insert_id)?;
        Ok((&self.template.tasks[pos], &self.tasks[pos]))
    }

    pub fn records(&self, insert_id: InsertId) -> Result<&TaskRecords> {
        let pos = self.task_position(insert_id)?;
        Ok(&self.tasks[pos])
    }

    pub(crate) fn records_mut(&mut self, insert_id: InsertId) -> Result<&mut TaskRecords> {
        let pos = self.task_position(insert_id)?;
        Ok(&mut self.tasks[pos])
    }

    /// Schemas of a task, resolved from the template components.
    pub fn schemas(&self, task: &StoredTask) -> Vec<&TaskSchema> {
        task.schemas
            .iter()
            .filter_map(|key| self.components.task_schemas.get(key))
            .collect()
    }

    pub fn insert_ids(&self) -> impl Iterator<Item = InsertId> + '_ {
        self.template.tasks.iter().map(|t| t.insert_id)
    }

    pub fn param(&self, id: ParamId) -> Option<(&ParamData, &ParamSource)> {
        Some((self.parameters.try_get(id)?, self.sources.try_get(id)?))
    }
}

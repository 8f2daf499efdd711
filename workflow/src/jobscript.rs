use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActionIdx, EarIdx, ElementIdx, InsertId, Resources};

/// One row of a jobscript: an action of a task at one position of the loop pathway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAction {
    pub task_insert_id: InsertId,
    pub action_idx: ActionIdx,
    /// Index into the jobscript's `task_loop_idx`.
    pub loop_idx_pos: usize,
}

/// How the elements of a dependent jobscript map onto the elements of the one it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobscriptDependency {
    /// Dependent jobscript element -> producer jobscript elements.
    pub js_element_mapping: BTreeMap<usize, Vec<usize>>,
    /// True if each dependent element waits on exactly one producer element, and vice versa,
    /// so a scheduler array dependency can be used.
    pub is_array: bool,
}

/// A batch of EARs with identical resources, submitted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jobscript {
    pub task_insert_ids: Vec<InsertId>,
    pub task_loop_idx: Vec<BTreeMap<String, u32>>,
    pub task_actions: Vec<TaskAction>,
    /// Elements per task, in jobscript column order.
    pub task_elements: BTreeMap<InsertId, Vec<ElementIdx>>,
    /// `ear_idx[action row][element column]`, `None` where that action does not run.
    pub ear_idx: Vec<Vec<Option<EarIdx>>>,
    pub resources: Resources,
    pub resource_hash: String,
    pub dependencies: BTreeMap<usize, JobscriptDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_job_ref: Option<String>,
}

impl Jobscript {
    pub fn num_elements(&self) -> usize {
        self.ear_idx.first().map_or(0, Vec::len)
    }

    pub fn num_actions(&self) -> usize {
        self.ear_idx.len()
    }

    /// Every (row, column, EAR) cell that holds an EAR.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize, EarIdx)> + '_ {
        self.ear_idx.iter().enumerate().flat_map(|(row, cols)| {
            cols.iter()
                .enumerate()
                .filter_map(move |(col, ear)| ear.map(|ear| (row, col, ear)))
        })
    }

    /// The task element in column `col` for the task of row `row`.
    pub fn element_at(&self, row: usize, col: usize) -> Option<ElementIdx> {
        let task = self.task_actions.get(row)?.task_insert_id;
        self.task_elements.get(&task)?.get(col).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub jobscripts: Vec<Jobscript>,
    /// Set once every jobscript has been handed to the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn is_dispatched(&self) -> bool {
        self.submit_time.is_some()
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use util::IdVec;

use crate::{ActionIdx, DataIdx, EarIdx, ElementIdx, InputSource, InsertId, IterIdx};

/// One point in a task's multiplicity cross-product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub element_set_idx: usize,
    /// Chosen value index per varying path.
    pub seq_idx: BTreeMap<String, usize>,
    /// Chosen source per input parameter.
    pub input_sources: BTreeMap<String, InputSource>,
    /// Upstream elements each task-sourced input path was taken from;
    /// several for a grouped input.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_elements: BTreeMap<String, Vec<ElementIdx>>,
    /// Task-wide indices of this element's iterations, in loop order.
    pub iterations: Vec<IterIdx>,
}

impl Element {
    pub fn latest_iteration(&self) -> Option<IterIdx> {
        self.iterations.last().copied()
    }
}

/// One loop-pass over an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub element_idx: ElementIdx,
    pub data_idx: DataIdx,
    #[serde(default)]
    pub loop_idx: BTreeMap<String, u32>,
    #[serde(default, rename = "EARs_initialised")]
    pub ears_initialised: bool,
    /// EARs per action; an action whose rules evaluated false has no entry.
    #[serde(default)]
    pub actions: BTreeMap<ActionIdx, Vec<EarIdx>>,
}

impl Iteration {
    pub fn new(element_idx: ElementIdx, data_idx: DataIdx, loop_idx: BTreeMap<String, u32>) -> Self {
        Self {
            element_idx,
            data_idx,
            loop_idx,
            ears_initialised: false,
            actions: BTreeMap::new(),
        }
    }

    /// True if every loop named in `loop_idx` is at the given position here.
    pub fn matches_loop_idx(&self, loop_idx: &BTreeMap<String, u32>) -> bool {
        loop_idx
            .iter()
            .all(|(name, i)| self.loop_idx.get(name).copied().unwrap_or(0) == *i)
    }
}

/// An element-action-run; indexed task-wide by [`EarIdx`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub element_idx: ElementIdx,
    pub iteration_idx: IterIdx,
    pub action_idx: ActionIdx,
    pub run_idx: u32,
    pub data_idx: DataIdx,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_idx: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Pre-execution lifecycle of an EAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EarStatus {
    Pending,
    Prepared,
    Submitted,
    Running,
    Complete,
}

impl std::fmt::Display for EarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Prepared => "prepared",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

impl Run {
    /// Derive the status; `dispatched` says whether this run's submission has been submitted.
    pub fn status(&self, dispatched: impl Fn(usize) -> bool) -> EarStatus {
        if self.end_time.is_some() {
            EarStatus::Complete
        } else if self.start_time.is_some() {
            EarStatus::Running
        } else if let Some(sub) = self.submission_idx {
            if dispatched(sub) {
                EarStatus::Submitted
            } else {
                EarStatus::Prepared
            }
        } else {
            EarStatus::Pending
        }
    }
}

/// Everything persisted for one task besides its template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecords {
    pub insert_id: InsertId,
    pub elements: IdVec<ElementIdx, Element>,
    pub iterations: IdVec<IterIdx, Iteration>,
    pub runs: IdVec<EarIdx, Run>,
}

impl TaskRecords {
    pub fn new(insert_id: InsertId) -> Self {
        Self {
            insert_id,
            ..Default::default()
        }
    }
}

/// Which task reads an iterable parameter, and which write it, within one loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterableParam {
    pub input_task: InsertId,
    pub output_tasks: Vec<InsertId>,
}

/// A persisted loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loop {
    pub name: String,
    pub tasks: Vec<InsertId>,
    pub num_iterations: u32,
    pub num_added_iterations: u32,
    pub iterable_parameters: BTreeMap<String, IterableParam>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run {
            element_idx: ElementIdx::new(0),
            iteration_idx: IterIdx::new(0),
            action_idx: ActionIdx::new(0),
            run_idx: 0,
            data_idx: DataIdx::new(),
            submission_idx: None,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn status_follows_lifecycle() {
        let mut r = run();
        assert_eq!(r.status(|_| false), EarStatus::Pending);
        r.submission_idx = Some(0);
        assert_eq!(r.status(|_| false), EarStatus::Prepared);
        assert_eq!(r.status(|_| true), EarStatus::Submitted);
        r.start_time = Some(Utc::now());
        assert_eq!(r.status(|_| true), EarStatus::Running);
        r.end_time = Some(Utc::now());
        assert_eq!(r.status(|_| true), EarStatus::Complete);
    }

    #[test]
    fn missing_loop_counts_as_zeroth_iteration() {
        let it = Iteration::new(ElementIdx::new(0), DataIdx::new(), BTreeMap::new());
        let mut want = BTreeMap::new();
        want.insert("outer".to_owned(), 0);
        assert!(it.matches_loop_idx(&want));
        want.insert("outer".to_owned(), 1);
        assert!(!it.matches_loop_idx(&want));
    }
}

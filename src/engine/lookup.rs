use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use store::Error as StoreError;
use workflow::{
    ActionIdx, DataIdx, EarId, EarIdx, EarStatus, ElementId, InputSource, InsertId,
    IterationId, ParamId, Resources, Run,
};

use super::ears::task_actions;
use super::{Error, Workflow};

/// An EAR and everything derived about it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ear {
    pub id: EarId,
    pub status: EarStatus,
    pub data_idx: DataIdx,
    pub resources: Resources,
    pub submission_idx: Option<usize>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementIteration {
    pub id: IterationId,
    pub data_idx: DataIdx,
    pub loop_idx: BTreeMap<String, u32>,
    pub ears_initialised: bool,
    pub actions: BTreeMap<ActionIdx, Vec<EarIdx>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementView {
    pub id: ElementId,
    pub element_set_idx: usize,
    pub seq_idx: BTreeMap<String, usize>,
    pub input_sources: BTreeMap<String, InputSource>,
    pub iterations: Vec<IterationId>,
}

impl Workflow<'_> {
    pub fn get_ears_from_ids(&self, ids: &[EarId]) -> Result<Vec<Ear>> {
        ids.iter()
            .map(|id| self.ear(id.task_insert_id, id.ear_idx))
            .collect()
    }

    pub fn get_element_iterations_from_ids(&self, ids: &[IterationId]) -> Result<Vec<ElementIteration>> {
        let doc = self.store.doc();
        ids.iter()
            .map(|id| {
                let it = doc
                    .records(id.task_insert_id)?
                    .iterations
                    .try_get(id.iteration_idx)
                    .ok_or(StoreError::UnknownIteration(id.task_insert_id, id.iteration_idx))?;
                Ok(ElementIteration {
                    id: IterationId {
                        element_idx: it.element_idx,
                        ..*id
                    },
                    data_idx: it.data_idx.clone(),
                    loop_idx: it.loop_idx.clone(),
                    ears_initialised: it.ears_initialised,
                    actions: it.actions.clone(),
                })
            })
            .collect()
    }

    pub fn get_elements_from_ids(&self, ids: &[ElementId]) -> Result<Vec<ElementView>> {
        let doc = self.store.doc();
        ids.iter()
            .map(|id| {
                let element = doc
                    .records(id.task_insert_id)?
                    .elements
                    .try_get(id.element_idx)
                    .ok_or(StoreError::UnknownElement(id.task_insert_id, id.element_idx))?;
                Ok(ElementView {
                    id: *id,
                    element_set_idx: element.element_set_idx,
                    seq_idx: element.seq_idx.clone(),
                    input_sources: element.input_sources.clone(),
                    iterations: element
                        .iterations
                        .iter()
                        .map(|&iteration_idx| IterationId {
                            task_insert_id: id.task_insert_id,
                            element_idx: id.element_idx,
                            iteration_idx,
                        })
                        .collect(),
                })
            })
            .collect()
    }

    pub fn ear(&self, task: InsertId, ear_idx: EarIdx) -> Result<Ear> {
        let run = self.run(task, ear_idx)?;
        Ok(Ear {
            id: ear_id(task, ear_idx, run),
            status: self.run_status(run),
            data_idx: run.data_idx.clone(),
            resources: self.ear_resources(task, run)?,
            submission_idx: run.submission_idx,
            start_time: run.start_time,
            end_time: run.end_time,
        })
    }

    /// IDs of every EAR of `task`, in EAR index order.
    pub fn ear_ids(&self, task: InsertId) -> Result<Vec<EarId>> {
        Ok(self
            .store
            .doc()
            .records(task)?
            .runs
            .enumerate()
            .map(|(idx, run)| ear_id(task, idx, run))
            .collect())
    }

    pub fn ear_status(&self, task: InsertId, ear_idx: EarIdx) -> Result<EarStatus> {
        Ok(self.run_status(self.run(task, ear_idx)?))
    }

    /// The value of a parameter, or `None` if it has not been set.
    pub fn parameter_value(&self, id: ParamId) -> Result<Option<&Value>> {
        let (data, _) = self
            .store
            .doc()
            .param(id)
            .ok_or(StoreError::UnknownParameter(id))?;
        Ok(data.value())
    }

    pub(super) fn run(&self, task: InsertId, ear_idx: EarIdx) -> Result<&Run> {
        Ok(self
            .store
            .doc()
            .records(task)?
            .runs
            .try_get(ear_idx)
            .ok_or(StoreError::UnknownEar(task, ear_idx))?)
    }

    fn run_status(&self, run: &Run) -> EarStatus {
        let submissions = &self.store.doc().submissions;
        run.status(|sub| submissions.get(sub).is_some_and(|s| s.is_dispatched()))
    }

    /// The resources a run is submitted with, merged for its action's scope.
    pub(super) fn ear_resources(&self, task: InsertId, run: &Run) -> Result<Resources> {
        let doc = self.store.doc();
        let (stored, _) = doc.task(task)?;
        let actions = task_actions(doc, stored);
        let action_idx = usize::from(run.action_idx);
        let (_, action) = actions
            .get(action_idx)
            .ok_or(Error::UnknownAction(task, action_idx))?;
        self.merged_resources(&run.data_idx, &action.scope())
    }
}

pub(super) fn ear_id(task: InsertId, ear_idx: EarIdx, run: &Run) -> EarId {
    EarId {
        task_insert_id: task,
        element_idx: run.element_idx,
        iteration_idx: run.iteration_idx,
        action_idx: run.action_idx,
        run_idx: run.run_idx,
        ear_idx,
    }
}

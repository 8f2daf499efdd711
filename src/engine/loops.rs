use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use store::{Error as StoreError, WorkflowDoc};
use workflow::{
    input_path, output_path, split_path, DataIdx, Element, ElementIdx, Error as WorkflowError,
    InputSource, InsertId, IterIdx, IterableParam, Iteration, Loop, LoopTemplate, ParamData,
    ParamRef, ParamSource, TaskRecords, TaskSourceType, OUTPUTS,
};

use super::resolve::TaskShape;
use super::{Error, Workflow};

impl Workflow<'_> {
    /// Add a loop over a contiguous range of tasks, with all its iterations.
    pub fn add_loop(&mut self, template: LoopTemplate) -> Result<usize> {
        self.batch_update(|wf| {
            let idx = wf.add_loop_inner(template)?;
            wf.initialise_pending_ears()?;
            Ok(idx)
        })
    }

    /// Add one more iteration to the named loop; returns its iteration number.
    pub fn add_iteration(&mut self, loop_name: &str) -> Result<u32> {
        self.batch_update(|wf| {
            let idx = wf
                .store
                .doc()
                .loops
                .iter()
                .position(|lp| lp.name == loop_name)
                .ok_or_else(|| Error::UnknownLoop(loop_name.to_owned()))?;
            let num = wf.add_loop_iteration(idx)?;
            wf.initialise_pending_ears()?;
            Ok(num)
        })
    }

    fn add_loop_inner(&mut self, template: LoopTemplate) -> Result<usize> {
        let doc = self.store.doc();
        if doc.loops.iter().any(|lp| lp.name == template.name) {
            return Err(Error::LoopExists(template.name).into());
        }
        let mut positions = template
            .tasks
            .iter()
            .map(|&task| doc.task_position(task))
            .collect::<Result<Vec<usize>>>()?;
        positions.sort_unstable();
        positions.dedup();
        if positions.is_empty() || positions.windows(2).any(|w| w[1] != w[0] + 1) {
            return Err(WorkflowError::LoopTasksNotContiguous(template.name).into());
        }
        let tasks: Vec<InsertId> = positions
            .iter()
            .map(|&pos| doc.template.tasks[pos].insert_id)
            .collect();

        let counts: BTreeSet<usize> = positions.iter().map(|&pos| doc.tasks[pos].elements.len()).collect();
        if counts.len() > 1 {
            return Err(WorkflowError::LoopElementMismatch(template.name).into());
        }
        let iterable_parameters = iterable_parameters(doc, &tasks)?;
        log::info!(
            "adding loop \"{}\" over {} tasks, {} iterable parameters",
            template.name,
            tasks.len(),
            iterable_parameters.len()
        );

        // existing iterations become the loop's first pass:
        let existing: Vec<(InsertId, IterIdx)> = positions
            .iter()
            .flat_map(|&pos| {
                let records = &doc.tasks[pos];
                records
                    .iterations
                    .enumerate()
                    .map(move |(idx, _)| (records.insert_id, idx))
            })
            .collect();
        for (task, iter) in existing {
            self.store.update_loop_idx(task, iter, &template.name, 0)?;
        }

        let idx = self.store.add_loop(Loop {
            name: template.name,
            tasks,
            num_iterations: template.num_iterations,
            num_added_iterations: 1,
            iterable_parameters,
        });
        for _ in 1..template.num_iterations {
            self.add_loop_iteration(idx)?;
        }
        Ok(idx)
    }

    /// Add the next pass of loop `idx` to every element of its tasks.
    fn add_loop_iteration(&mut self, idx: usize) -> Result<u32> {
        let lp = self
            .store
            .doc()
            .loops
            .get(idx)
            .cloned()
            .ok_or_else(|| Error::UnknownLoop(idx.to_string()))?;
        let num = lp.num_added_iterations;
        log::debug!("adding iteration {num} of loop \"{}\"", lp.name);

        // task -> new iteration per element
        let mut added: BTreeMap<InsertId, Vec<IterIdx>> = BTreeMap::new();
        for &task in &lp.tasks {
            let outputs = TaskShape::of(self.store.doc(), task)?.outputs();
            let num_elements = self.store.doc().records(task)?.elements.len();
            let mut new_iters = Vec::with_capacity(num_elements);

            for e in 0..num_elements {
                let element_idx = ElementIdx::from(e);
                let (mut data_idx, loop_idx) =
                    self.next_iteration_data(&lp, num, task, element_idx, &added)?;
                let iteration_idx = self.store.doc().records(task)?.iterations.next_id();
                for output in &outputs {
                    let id = self.store.add_parameter(
                        ParamData::Unset,
                        ParamSource::iteration_output(task, element_idx, iteration_idx),
                    )?;
                    data_idx.insert(output_path(output), id.into());
                }
                let iteration_idx = self
                    .store
                    .add_iteration(task, Iteration::new(element_idx, data_idx, loop_idx))?;
                new_iters.push(iteration_idx);
            }
            added.insert(task, new_iters);
        }

        self.store.update_loop_num_added(idx, num + 1);
        Ok(num)
    }

    /// Inputs and loop position for pass `num` of an element: the previous pass's
    /// inputs, with iterable parameters taken from the previous pass's outputs and
    /// inputs from loop tasks already advanced in this pass rebound to them.
    fn next_iteration_data(
        &self,
        lp: &Loop,
        num: u32,
        task: InsertId,
        element_idx: ElementIdx,
        added: &BTreeMap<InsertId, Vec<IterIdx>>,
    ) -> Result<(DataIdx, BTreeMap<String, u32>)> {
        let doc = self.store.doc();
        let records = doc.records(task)?;
        let element = records
            .elements
            .try_get(element_idx)
            .ok_or(StoreError::UnknownElement(task, element_idx))?;
        let prev = iteration_at(records, element, &lp.name, num - 1)
            .ok_or_else(|| WorkflowError::LoopElementMismatch(lp.name.clone()))?;

        let mut data_idx: DataIdx = prev
            .data_idx
            .iter()
            .filter(|(key, _)| !matches!(split_path(key), Some((OUTPUTS, _))))
            .map(|(key, param)| (key.clone(), param.clone()))
            .collect();
        let mut loop_idx = prev.loop_idx.clone();
        loop_idx.insert(lp.name.clone(), num);

        for (param, iterable) in &lp.iterable_parameters {
            if iterable.input_task != task {
                continue;
            }
            let Some(&producer) = iterable.output_tasks.last() else {
                continue;
            };
            let producer_records = doc.records(producer)?;
            let producer_iter = producer_records
                .elements
                .try_get(element_idx)
                .and_then(|el| iteration_at(producer_records, el, &lp.name, num - 1))
                .ok_or_else(|| WorkflowError::LoopElementMismatch(lp.name.clone()))?;
            if let Some(out) = producer_iter.data_idx.get(&output_path(param)) {
                log::trace!("loop \"{}\": {param} of task {task} element {element_idx} iterates", lp.name);
                data_idx.insert(input_path(param), out.clone());
            }
        }

        for (param, source) in &element.input_sources {
            let InputSource::Task {
                task: upstream,
                source_type,
            } = source
            else {
                continue;
            };
            let iterates = lp
                .iterable_parameters
                .get(param)
                .is_some_and(|it| it.input_task == task);
            let Some(new_iters) = added.get(upstream) else {
                continue;
            };
            if iterates {
                continue;
            }
            let key = input_path(param);
            let upstream_key = match source_type {
                TaskSourceType::Output => output_path(param),
                TaskSourceType::Input => input_path(param),
            };
            let upstream_records = doc.records(*upstream)?;
            let lookup = |iter: IterIdx| {
                upstream_records
                    .iterations
                    .try_get(iter)
                    .and_then(|it| it.data_idx.get(&upstream_key))
            };
            let Some(current) = data_idx.get(&key) else {
                continue;
            };
            let mismatch = || WorkflowError::LoopElementMismatch(lp.name.clone());
            let sources = element.source_elements.get(&key).ok_or_else(mismatch)?;
            let mut refs = Vec::with_capacity(sources.len());
            for &upstream_elem in sources {
                let param_ref = new_iters
                    .get(usize::from(upstream_elem))
                    .and_then(|&it| lookup(it))
                    .ok_or_else(mismatch)?;
                refs.push(param_ref);
            }
            let rebound = match (current, refs.as_slice()) {
                (ParamRef::One(_), [one]) => (*one).clone(),
                (ParamRef::One(_), _) => return Err(mismatch().into()),
                (ParamRef::Many(_), _) => {
                    ParamRef::Many(refs.iter().flat_map(|r| r.ids().iter().copied()).collect())
                }
            };
            log::trace!(
                "loop \"{}\": {key} of task {task} element {element_idx} rebound to {rebound:?}",
                lp.name
            );
            data_idx.insert(key, rebound);
        }

        Ok((data_idx, loop_idx))
    }
}

/// The latest iteration of `element` at pass `num` of the named loop.
fn iteration_at<'a>(
    records: &'a TaskRecords,
    element: &Element,
    loop_name: &str,
    num: u32,
) -> Option<&'a Iteration> {
    element
        .iterations
        .iter()
        .rev()
        .filter_map(|&idx| records.iterations.try_get(idx))
        .find(|it| it.loop_idx.get(loop_name).copied().unwrap_or(0) == num)
}

/// Inputs of the loop's tasks that the loop itself produces, and whose first
/// reader comes no later than their first writer.
fn iterable_parameters(doc: &WorkflowDoc, tasks: &[InsertId]) -> Result<BTreeMap<String, IterableParam>> {
    let shapes = tasks
        .iter()
        .map(|&task| TaskShape::of(doc, task))
        .collect::<Result<Vec<_>>>()?;
    let reads = |i: usize, param: &str| shapes[i].schemas.iter().any(|s| s.input(param).is_some());
    let writes = |i: usize, param: &str| shapes[i].schemas.iter().any(|s| s.has_output(param));

    let params: BTreeSet<&str> = shapes
        .iter()
        .flat_map(|shape| shape.schemas.iter().flat_map(|s| &s.inputs))
        .map(|input| input.parameter.as_str())
        .collect();

    let mut iterable = BTreeMap::new();
    for param in params {
        let Some(first_reader) = (0..tasks.len()).find(|&i| reads(i, param)) else {
            continue;
        };
        let writers: Vec<usize> = (0..tasks.len()).filter(|&i| writes(i, param)).collect();
        match writers.first() {
            Some(&first_writer) if first_reader <= first_writer => {
                iterable.insert(
                    param.to_owned(),
                    IterableParam {
                        input_task: tasks[first_reader],
                        output_tasks: writers.iter().map(|&i| tasks[i]).collect(),
                    },
                );
            }
            _ => (),
        }
    }
    Ok(iterable)
}

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;

use store::{Error as StoreError, StoredTask, WorkflowDoc};
use workflow::{
    get_in, input_file_path, input_path, output_file_path, output_path, resource_path, set_in,
    split_path,
    Action, ActionIdx, ActionRule, ActionScope, DataIdx, EarIdx, Error as WorkflowError,
    InsertId, IterIdx, Iteration, ParamData, ParamRef, ParamSource, Resources, Run, SourceKind,
    SourcePatch, TaskSchema, RESOURCES,
};

use super::Workflow;
use crate::context::cast_value;

/// An EAR worked out for an iteration, before it is stored.
struct PlannedRun {
    action_idx: ActionIdx,
    data_idx: DataIdx,
    /// Keys of `data_idx` this run produces.
    outputs: Vec<String>,
}

impl Workflow<'_> {
    /// Create EARs for every iteration whose action rules can now be evaluated.
    /// Returns the number of iterations initialised.
    pub fn initialise_ears(&mut self) -> Result<usize> {
        self.batch_update(|wf| wf.initialise_pending_ears())
    }

    /// One pass over all uninitialised iterations.
    pub(super) fn initialise_pending_ears(&mut self) -> Result<usize> {
        let todo: Vec<(InsertId, IterIdx)> = self
            .store
            .doc()
            .tasks
            .iter()
            .flat_map(|records| {
                records
                    .iterations
                    .enumerate()
                    .filter(|(_, it)| !it.ears_initialised)
                    .map(move |(idx, _)| (records.insert_id, idx))
            })
            .collect();

        let mut count = 0;
        for (task, iter) in todo {
            if self.initialise_iteration(task, iter)? {
                count += 1;
            }
        }
        if count > 0 {
            log::info!("initialised EARs for {count} iterations");
        }
        Ok(count)
    }

    /// Returns false, having changed nothing, if a rule reads a parameter
    /// that has no value yet.
    fn initialise_iteration(&mut self, task: InsertId, iter: IterIdx) -> Result<bool> {
        let doc = self.store.doc();
        let (stored, records) = doc.task(task)?;
        let actions = task_actions(doc, stored);
        let iteration = records
            .iterations
            .try_get(iter)
            .ok_or(StoreError::UnknownIteration(task, iter))?
            .clone();

        let mut included = Vec::with_capacity(actions.len());
        for (idx, (_, action)) in actions.iter().enumerate() {
            match self.rules_hold(&iteration.data_idx, &action.rules, &action.scope()) {
                Ok(true) => included.push(idx),
                Ok(false) => log::trace!("task {task} iteration {iter}: skipping action {idx}"),
                Err(e) if is_unset(&e) => {
                    log::debug!("deferring EARs of task {task} iteration {iter}: {e}");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        let mut runs: Vec<PlannedRun> = Vec::with_capacity(included.len());
        for idx in included {
            let (schema, action) = &actions[idx];
            let run = self.generate_data_index(task, iter, &iteration, ActionIdx::from(idx), schema, action, &mut runs)?;
            runs.push(run);
        }

        let mut ears: BTreeMap<ActionIdx, Vec<EarIdx>> = BTreeMap::new();
        for planned in runs {
            let ear_idx = self.store.add_ear(
                task,
                Run {
                    element_idx: iteration.element_idx,
                    iteration_idx: iter,
                    action_idx: planned.action_idx,
                    run_idx: 0,
                    data_idx: planned.data_idx.clone(),
                    submission_idx: None,
                    start_time: None,
                    end_time: None,
                },
            )?;
            let patch = SourcePatch {
                action_idx: planned.action_idx,
                run_idx: 0,
                ear_idx,
            };
            for key in &planned.outputs {
                let Some(param) = planned.data_idx.get(key) else {
                    continue;
                };
                for &id in param.ids() {
                    let is_output = self
                        .store
                        .doc()
                        .sources
                        .try_get(id)
                        .is_some_and(|s| s.kind == SourceKind::EarOutput);
                    if is_output {
                        self.store.patch_source(id, &patch)?;
                    }
                }
            }
            ears.entry(planned.action_idx).or_default().push(ear_idx);
        }
        log::trace!("task {task} iteration {iter}: {} actions run", ears.len());
        self.store.set_iteration_ears(task, iter, ears)?;
        Ok(true)
    }

    /// Build the data index of one EAR from its iteration's, given the EARs
    /// already planned for earlier actions of the same iteration.
    #[allow(clippy::too_many_arguments)]
    fn generate_data_index(
        &mut self,
        task: InsertId,
        iter: IterIdx,
        iteration: &Iteration,
        action_idx: ActionIdx,
        schema: &TaskSchema,
        action: &Action,
        earlier: &mut [PlannedRun],
    ) -> Result<PlannedRun> {
        let placeholder = ParamSource::iteration_output(task, iteration.element_idx, iter);
        let mut data_idx = DataIdx::new();
        let mut outputs = Vec::new();

        // latest earlier producer of each output key
        let mut producers: BTreeMap<String, usize> = BTreeMap::new();
        for (pos, run) in earlier.iter().enumerate() {
            for key in &run.outputs {
                producers.insert(key.clone(), pos);
            }
        }

        for output in action.output_types(schema) {
            let key = output_path(&output);
            let taken = match producers.get(&key) {
                Some(&pos) => {
                    // the earlier action gets a fresh parameter, this one keeps the original:
                    let fresh = self.store.add_parameter(ParamData::Unset, placeholder.clone())?;
                    earlier[pos].data_idx.insert(key.clone(), fresh.into())
                }
                None => iteration.data_idx.get(&key).cloned(),
            };
            let param = match taken {
                Some(param) => param,
                None => self.store.add_parameter(ParamData::Unset, placeholder.clone())?.into(),
            };
            data_idx.insert(key.clone(), param);
            outputs.push(key);
        }

        for input in action.input_types(schema) {
            let key = input_path(&input);
            let out_key = output_path(&input);
            let aliased = producers
                .get(&out_key)
                .and_then(|&pos| earlier[pos].data_idx.get(&out_key).cloned());
            let param = match aliased {
                Some(param) => param,
                None => match iteration.data_idx.get(&key) {
                    Some(param) => {
                        data_idx.extend(sub_entries(&iteration.data_idx, &key));
                        param.clone()
                    }
                    None => {
                        let source = ParamSource::local_input(task);
                        self.store.add_parameter(ParamData::Unset, source)?.into()
                    }
                },
            };
            data_idx.insert(key, param);
        }

        let generated = action.input_file_generator.iter();
        for label in generated.chain(&action.output_files) {
            let key = if action.input_file_generator.as_ref() == Some(label) {
                input_file_path(label)
            } else {
                output_file_path(label)
            };
            let param = match iteration.data_idx.get(&key) {
                Some(param) => param.clone(),
                None => self.store.add_parameter(ParamData::Unset, placeholder.clone())?.into(),
            };
            data_idx.insert(key.clone(), param);
            outputs.push(key);
        }
        for label in &action.input_files {
            let key = input_file_path(label);
            if data_idx.contains_key(&key) {
                continue;
            }
            let param = match iteration.data_idx.get(&key) {
                Some(param) => param.clone(),
                None => {
                    let source = ParamSource::local_input(task);
                    self.store.add_parameter(ParamData::Unset, source)?.into()
                }
            };
            data_idx.insert(key, param);
        }

        for (key, param) in &iteration.data_idx {
            if matches!(split_path(key), Some((RESOURCES, _))) {
                data_idx.insert(key.clone(), param.clone());
            }
        }

        Ok(PlannedRun {
            action_idx,
            data_idx,
            outputs,
        })
    }

    /// Do all `rules` hold for `data_idx`? Resource paths read the resources
    /// merged for `scope`.
    pub(super) fn rules_hold(
        &self,
        data_idx: &DataIdx,
        rules: &[ActionRule],
        scope: &ActionScope,
    ) -> Result<bool> {
        for rule in rules {
            let holds = match rule {
                ActionRule::CheckExists(path) => self.path_exists(data_idx, path)?,
                ActionRule::CheckMissing(path) => !self.path_exists(data_idx, path)?,
                ActionRule::Condition(cond) => {
                    let value = self.rule_value(data_idx, scope, &cond.path)?;
                    let value = match cond.cast {
                        Some(cast) => cast_value(&value, cast)?,
                        None => value,
                    };
                    self.ctx.evaluator().evaluate(cond, &value)?
                }
            };
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The value a condition at `path` reads; `resources.<key>` reads the
    /// action's merged resources unless `path` names a whole scope.
    fn rule_value(&self, data_idx: &DataIdx, scope: &ActionScope, path: &str) -> Result<Value> {
        if let (Some((RESOURCES, key)), false) = (split_path(path), data_idx.contains_key(path)) {
            let resources = self.merged_resources(data_idx, scope)?;
            return Ok(resources.get(key).cloned().unwrap_or(Value::Null));
        }
        Ok(self.path_value(data_idx, path)?.unwrap_or(Value::Null))
    }

    /// `inputs.p1` only has to be in the data index; a sub-parameter path
    /// like `inputs.p1.a` has to resolve to a value.
    fn path_exists(&self, data_idx: &DataIdx, path: &str) -> Result<bool> {
        if data_idx.contains_key(path) || path.split('.').count() <= 2 {
            return Ok(data_idx.contains_key(path));
        }
        Ok(self.path_value(data_idx, path)?.is_some())
    }

    /// The value at a dotted path: the nearest enclosing data index entry,
    /// with any sub-parameter entries below it merged in. `None` if no entry
    /// covers the path.
    pub(super) fn path_value(&self, data_idx: &DataIdx, path: &str) -> Result<Option<Value>> {
        let segments: Vec<&str> = path.split('.').collect();
        for split in (2..=segments.len()).rev() {
            let key = segments[..split].join(".");
            let Some(param) = data_idx.get(&key) else {
                continue;
            };
            let mut value = self.param_value(&key, param)?;
            for (sub, sub_param) in sub_entries(data_idx, &key) {
                let sub_value = self.param_value(&sub, &sub_param)?;
                let rel: Vec<&str> = sub[key.len() + 1..].split('.').collect();
                set_in(&mut value, &rel, sub_value);
            }
            return Ok(get_in(&value, &segments[split..]).cloned());
        }
        Ok(None)
    }

    /// The value of a data index entry; an entry naming several parameters
    /// gives a list. Fails with `UnsetParameterData` if any has no value.
    pub(super) fn param_value(&self, path: &str, param: &ParamRef) -> Result<Value> {
        let doc = self.store.doc();
        let one = |id| -> Result<Value> {
            match doc.param(id) {
                Some((ParamData::Set(val), _)) => Ok(val.clone()),
                Some((ParamData::Unset, _)) => {
                    Err(WorkflowError::UnsetParameterData(path.to_owned()).into())
                }
                None => Err(StoreError::UnknownParameter(id).into()),
            }
        };
        match param {
            ParamRef::One(id) => one(*id),
            ParamRef::Many(ids) => Ok(Value::Array(
                ids.iter().map(|&id| one(id)).collect::<Result<_>>()?,
            )),
        }
    }

    /// Resources for an action scope, most specific scope first.
    pub(super) fn merged_resources(&self, data_idx: &DataIdx, scope: &ActionScope) -> Result<Resources> {
        let mut resources = Resources::default();
        for scope in scope.resource_scopes() {
            let path = resource_path(&scope);
            let Some(param) = data_idx.get(&path) else {
                continue;
            };
            if let Value::Object(settings) = self.param_value(&path, param)? {
                resources.fill_from(&settings);
            }
        }
        Ok(resources)
    }
}

/// Every action of a task, across all its schemas, in `ActionIdx` order.
pub(super) fn task_actions(doc: &WorkflowDoc, task: &StoredTask) -> Vec<(TaskSchema, Action)> {
    doc.schemas(task)
        .into_iter()
        .flat_map(|schema| {
            schema
                .actions
                .iter()
                .map(move |action| (schema.clone(), action.clone()))
        })
        .collect()
}

/// Sub-parameter entries of `key`, e.g. `inputs.p1.a` for `inputs.p1`.
fn sub_entries(data_idx: &DataIdx, key: &str) -> Vec<(String, ParamRef)> {
    let prefix = format!("{key}.");
    data_idx
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn is_unset(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::UnsetParameterData(_))
    )
}

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde_json::Value;

use store::{Error as StoreError, WorkflowDoc};
use workflow::{
    input_path, output_path, resolve_multiplicities, resource_path, root_param, split_path,
    ActionScope, DataIdx, Element, ElementIdx, ElementSet, Error as WorkflowError, InputSource,
    InsertId, IterIdx, Iteration, MultiplicityRecord, ParamData, ParamId, ParamRef, ParamSource,
    ResourceSpec, SchemaInput, TaskSchema, TaskSourceType, BROADCAST, INPUTS, SCOPE_ANY,
};

use super::Workflow;

/// What the resolver needs to know about the task an element set belongs to.
pub(super) struct TaskShape {
    pub insert_id: InsertId,
    /// Position in the task list; tasks before it are upstream.
    pub pos: usize,
    pub name: String,
    pub schemas: Vec<TaskSchema>,
}

impl TaskShape {
    pub fn of(doc: &WorkflowDoc, insert_id: InsertId) -> Result<Self> {
        let pos = doc.task_position(insert_id)?;
        let stored = &doc.template.tasks[pos];
        Ok(Self {
            insert_id,
            pos,
            name: stored.name.clone(),
            schemas: doc.schemas(stored).into_iter().cloned().collect(),
        })
    }

    /// Schema inputs, first declaration winning.
    fn inputs(&self) -> Vec<&SchemaInput> {
        let mut seen = BTreeSet::new();
        self.schemas
            .iter()
            .flat_map(|s| &s.inputs)
            .filter(|i| seen.insert(i.parameter.as_str()))
            .collect()
    }

    pub fn outputs(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        for o in self.schemas.iter().flat_map(|s| &s.outputs) {
            if !outputs.contains(&o.parameter) {
                outputs.push(o.parameter.clone());
            }
        }
        outputs
    }

    /// Sub-parameters such as `p1.a` are accepted wherever `p1` is.
    fn accepts(&self, param: &str) -> bool {
        let root = root_param(param);
        self.schemas.iter().any(|s| s.input(root).is_some())
    }

    fn unexpected(&self, input: &str) -> WorkflowError {
        WorkflowError::TaskTemplateUnexpectedInput {
            task: self.name.clone(),
            input: input.to_owned(),
        }
    }
}

enum PathValues {
    /// Stored as new parameters, one per value.
    New { values: Vec<Value>, source: ParamSource },
    /// Existing parameters, one per upstream candidate.
    Existing(Vec<SourcedRef>),
}

/// An upstream parameter reference and the upstream elements it came from.
struct SourcedRef {
    param: ParamRef,
    elements: Vec<ElementIdx>,
}

struct ResolvedPath {
    path: String,
    values: PathValues,
    record: MultiplicityRecord,
    /// Recorded in each element's `seq_idx`.
    varying: bool,
}

/// An element set checked against its task, with its elements worked out.
/// Applying it cannot fail validation.
pub(super) struct ElementSetPlan {
    paths: Vec<ResolvedPath>,
    input_sources: BTreeMap<String, InputSource>,
    outputs: Vec<String>,
    elements: Vec<BTreeMap<String, usize>>,
}

impl ElementSetPlan {
    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }
}

/// An input's locally given values.
struct LocalValues {
    values: Vec<Value>,
    nesting_order: Option<f64>,
    sequence: bool,
}

impl LocalValues {
    fn resolve(&self, task: &TaskShape, set: &ElementSet, path: String) -> ResolvedPath {
        let order = match self
            .nesting_order
            .or_else(|| set.nesting_order.get(&path).copied())
        {
            Some(order) => order,
            None if self.values.len() == 1 => BROADCAST,
            None => 0.0,
        };
        ResolvedPath {
            record: MultiplicityRecord::new(path.clone(), self.values.len(), order),
            path,
            values: PathValues::New {
                values: self.values.clone(),
                source: ParamSource::local_input(task.insert_id),
            },
            varying: self.sequence,
        }
    }
}

// PLANNING ////////////////////
impl Workflow<'_> {
    /// Validate `set` against `task` and expand it, without changing anything.
    pub(super) fn plan_element_set(&self, task: &TaskShape, set: &ElementSet) -> Result<ElementSetPlan> {
        let local = local_values(task, set)?;
        for (path, &order) in &set.nesting_order {
            check_nesting(path, order)?;
        }

        let mut paths = Vec::new();
        let mut input_sources = BTreeMap::new();
        let mut missing = Vec::new();

        for input in task.inputs() {
            let param = &input.parameter;
            let path = input_path(param);
            let Some(source) = self.select_source(task, set, input, local.contains_key(param))?
            else {
                missing.push(param.clone());
                continue;
            };
            log::trace!("task {}: {path} from {source}", task.name);

            let resolved = match &source {
                InputSource::Local => local[param].resolve(task, set, path),
                InputSource::Default => ResolvedPath {
                    record: MultiplicityRecord::broadcast(path.clone()),
                    path,
                    values: PathValues::New {
                        values: input.default_value.iter().cloned().collect(),
                        source: ParamSource::default_input(task.insert_id),
                    },
                    varying: false,
                },
                InputSource::Task {
                    task: upstream,
                    source_type,
                } => {
                    let (refs, varying) = match &input.group {
                        Some(group) => {
                            let refs = self.grouped_refs(*upstream, *source_type, param, group, set)?;
                            let varying = refs.len() > 1;
                            (refs, varying)
                        }
                        None => {
                            let refs = self.upstream_refs(*upstream, *source_type, param, set)?;
                            if refs.is_empty() {
                                return Err(WorkflowError::InvalidInputSource {
                                    input: param.clone(),
                                    reason: format!("task {upstream} has no elements to source from"),
                                }
                                .into());
                            }
                            (refs, true)
                        }
                    };
                    let order = match set.nesting_order.get(&path) {
                        Some(&order) => order,
                        None if refs.len() == 1 => BROADCAST,
                        None => 0.0,
                    };
                    ResolvedPath {
                        record: MultiplicityRecord::new(path.clone(), refs.len(), order),
                        path,
                        values: PathValues::Existing(refs),
                        varying,
                    }
                }
            };
            paths.push(resolved);
            input_sources.insert(param.clone(), source);
        }

        if !missing.is_empty() {
            return Err(WorkflowError::MissingInputs {
                task: task.name.clone(),
                missing,
            }
            .into());
        }

        // sub-parameter values overlay part of their parent's value:
        for (param, values) in local.iter().filter(|(p, _)| p.contains('.')) {
            paths.push(values.resolve(task, set, input_path(param)));
        }

        for (spec, source) in self.resource_specs(task, set)? {
            let path = resource_path(&spec.scope);
            paths.push(ResolvedPath {
                record: MultiplicityRecord::broadcast(path.clone()),
                path,
                values: PathValues::New {
                    values: vec![spec.to_value()],
                    source,
                },
                varying: false,
            });
        }

        let records: Vec<MultiplicityRecord> = paths.iter().map(|p| p.record.clone()).collect();
        let elements = resolve_multiplicities(&records)?;
        log::debug!("task {}: element set expands to {} elements", task.name, elements.len());

        Ok(ElementSetPlan {
            paths,
            input_sources,
            outputs: task.outputs(),
            elements,
        })
    }

    /// Pick where `input` comes from, in priority order: local values, an
    /// explicit source, the nearest upstream producer, the schema default.
    fn select_source(
        &self,
        task: &TaskShape,
        set: &ElementSet,
        input: &SchemaInput,
        has_local: bool,
    ) -> Result<Option<InputSource>> {
        let param = &input.parameter;
        if has_local {
            return Ok(Some(InputSource::Local));
        }
        if let Some(source) = set.input_sources.get(param).and_then(|s| s.first()) {
            self.check_source(task, input, source)?;
            return Ok(Some(source.clone()));
        }

        let doc = self.store.doc();
        for source_type in [TaskSourceType::Output, TaskSourceType::Input] {
            for upstream in doc.template.tasks[..task.pos].iter().rev() {
                let grouped_ok = input
                    .group
                    .as_ref()
                    .map_or(true, |g| upstream.groups.iter().any(|gr| gr.name == *g));
                if grouped_ok && provides(doc, upstream.insert_id, source_type, param) {
                    return Ok(Some(InputSource::Task {
                        task: upstream.insert_id,
                        source_type,
                    }));
                }
            }
        }

        if input.default_value.is_some() {
            return Ok(Some(InputSource::Default));
        }
        Ok(None)
    }

    fn check_source(&self, task: &TaskShape, input: &SchemaInput, source: &InputSource) -> Result<()> {
        let invalid = |reason: String| WorkflowError::InvalidInputSource {
            input: input.parameter.clone(),
            reason,
        };
        match source {
            InputSource::Local => Err(invalid("no local value is given".to_owned()).into()),
            InputSource::Default if input.default_value.is_none() => {
                Err(invalid("the schema has no default".to_owned()).into())
            }
            InputSource::Default => Ok(()),
            InputSource::Task {
                task: upstream,
                source_type,
            } => {
                let doc = self.store.doc();
                let Ok(pos) = doc.task_position(*upstream) else {
                    return Err(invalid(format!("task {upstream} does not exist")).into());
                };
                if pos >= task.pos {
                    return Err(invalid(format!("task {upstream} is not upstream")).into());
                }
                if !provides(doc, *upstream, *source_type, &input.parameter) {
                    return Err(invalid(format!("task {upstream} does not provide it")).into());
                }
                if let Some(group) = &input.group {
                    if !doc.template.tasks[pos].groups.iter().any(|gr| gr.name == *group) {
                        return Err(invalid(format!("task {upstream} has no group \"{group}\"")).into());
                    }
                }
                Ok(())
            }
        }
    }

    /// The sourceable iterations of `upstream`: those `set` is restricted to,
    /// otherwise the latest iteration of every element.
    fn upstream_iterations(&self, upstream: InsertId, set: &ElementSet) -> Result<Vec<&Iteration>> {
        let records = self.store.doc().records(upstream)?;
        let iterations: Vec<IterIdx> = match set
            .sourceable_elem_iters
            .as_ref()
            .and_then(|m| m.get(&upstream))
        {
            Some(restricted) => restricted.clone(),
            None => records
                .elements
                .iter()
                .filter_map(Element::latest_iteration)
                .collect(),
        };
        let mut found = Vec::with_capacity(iterations.len());
        for iter in iterations {
            let it = records
                .iterations
                .try_get(iter)
                .ok_or(StoreError::UnknownIteration(upstream, iter))?;
            found.push(it);
        }
        Ok(found)
    }

    /// One parameter reference per sourceable iteration of `upstream`.
    fn upstream_refs(
        &self,
        upstream: InsertId,
        source_type: TaskSourceType,
        param: &str,
        set: &ElementSet,
    ) -> Result<Vec<SourcedRef>> {
        let key = source_key(source_type, param);
        let mut refs = Vec::new();
        for it in self.upstream_iterations(upstream, set)? {
            refs.push(SourcedRef {
                param: source_ref(it, &key, upstream, param)?,
                elements: vec![it.element_idx],
            });
        }
        Ok(refs)
    }

    /// References for an input sourced from a group of `upstream`'s elements:
    /// a single list of the members, or one list per distinct value of the
    /// group's `group_by_distinct` path, in order of first appearance.
    fn grouped_refs(
        &self,
        upstream: InsertId,
        source_type: TaskSourceType,
        param: &str,
        group_name: &str,
        set: &ElementSet,
    ) -> Result<Vec<SourcedRef>> {
        let invalid = |reason: String| WorkflowError::InvalidInputSource {
            input: param.to_owned(),
            reason,
        };
        let (stored, _) = self.store.doc().task(upstream)?;
        let Some(group) = stored.groups.iter().find(|g| g.name == group_name) else {
            return Err(invalid(format!("task {upstream} has no group \"{group_name}\"")).into());
        };
        let key = source_key(source_type, param);

        let mut classes: Vec<(Option<Value>, Vec<ParamId>, Vec<ElementIdx>)> = Vec::new();
        for it in self.upstream_iterations(upstream, set)? {
            if !self.rules_hold(&it.data_idx, &group.filter, &ActionScope::Main)? {
                continue;
            }
            let ids = source_ref(it, &key, upstream, param)?.ids().to_vec();
            let class = match &group.group_by_distinct {
                Some(path) => Some(self.path_value(&it.data_idx, path)?.unwrap_or(Value::Null)),
                None => None,
            };
            match classes.iter_mut().find(|(c, _, _)| *c == class) {
                Some((_, members, elements)) => {
                    members.extend(ids);
                    elements.push(it.element_idx);
                }
                None => classes.push((class, ids, vec![it.element_idx])),
            }
        }
        log::debug!(
            "group {group_name} of task {upstream}: {} members in {} classes",
            classes.iter().map(|(_, _, elements)| elements.len()).sum::<usize>(),
            classes.len()
        );

        if classes.is_empty() {
            if group.group_by_distinct.is_some() {
                return Err(invalid(format!("group \"{group_name}\" has no members")).into());
            }
            classes.push((None, Vec::new(), Vec::new()));
        }
        Ok(classes
            .into_iter()
            .map(|(_, ids, elements)| SourcedRef {
                param: ParamRef::Many(ids),
                elements,
            })
            .collect())
    }

    /// Resource specs for each scope, with the workflow-wide specs filling in
    /// scopes the element set leaves out, and `any` always present.
    fn resource_specs(&self, task: &TaskShape, set: &ElementSet) -> Result<Vec<(ResourceSpec, ParamSource)>> {
        let mut specs: Vec<(ResourceSpec, ParamSource)> = Vec::new();
        for spec in &set.resources {
            if specs.iter().any(|(s, _)| s.scope == spec.scope) {
                return Err(
                    WorkflowError::TaskTemplateMultipleInputValues(resource_path(&spec.scope)).into(),
                );
            }
            specs.push((spec.clone(), ParamSource::local_input(task.insert_id)));
        }
        for spec in &self.store.doc().template.resources {
            if !specs.iter().any(|(s, _)| s.scope == spec.scope) {
                specs.push((spec.clone(), ParamSource::workflow_resources()));
            }
        }
        if !specs.iter().any(|(s, _)| s.scope == SCOPE_ANY) {
            specs.push((ResourceSpec::any(), ParamSource::workflow_resources()));
        }
        Ok(specs)
    }
}

// APPLYING ////////////////////
impl Workflow<'_> {
    /// Store a planned element set: its parameters, elements and zeroth iterations.
    pub(super) fn apply_element_set(
        &mut self,
        task: InsertId,
        set: ElementSet,
        plan: ElementSetPlan,
    ) -> Result<Vec<(ElementIdx, IterIdx)>> {
        let set_idx = self.store.add_element_set(task, set)?;

        // values are stored once, and shared by every element that uses them:
        let mut refs: Vec<Vec<ParamRef>> = Vec::with_capacity(plan.paths.len());
        for resolved in &plan.paths {
            refs.push(match &resolved.values {
                PathValues::New { values, source } => {
                    let mut ids = Vec::with_capacity(values.len());
                    for val in values {
                        let id = self
                            .store
                            .add_parameter(ParamData::Set(val.clone()), source.clone())?;
                        ids.push(ParamRef::One(id));
                    }
                    ids
                }
                PathValues::Existing(existing) => existing.iter().map(|r| r.param.clone()).collect(),
            });
        }

        let loop_idx: BTreeMap<String, u32> = self
            .store
            .doc()
            .loops
            .iter()
            .filter(|lp| lp.tasks.contains(&task))
            .map(|lp| (lp.name.clone(), 0))
            .collect();

        let mut added = Vec::with_capacity(plan.elements.len());
        for chosen in &plan.elements {
            let seq_idx = plan
                .paths
                .iter()
                .filter(|p| p.varying)
                .map(|p| (p.path.clone(), chosen.get(&p.path).copied().unwrap_or(0)))
                .collect();
            let source_elements = plan
                .paths
                .iter()
                .filter_map(|p| match &p.values {
                    PathValues::Existing(existing) => {
                        let i = chosen.get(&p.path).copied().unwrap_or(0);
                        existing.get(i).map(|r| (p.path.clone(), r.elements.clone()))
                    }
                    PathValues::New { .. } => None,
                })
                .collect();
            let element_idx = self.store.add_element(
                task,
                Element {
                    element_set_idx: set_idx,
                    seq_idx,
                    input_sources: plan.input_sources.clone(),
                    source_elements,
                    iterations: Vec::new(),
                },
            )?;
            let iteration_idx = self.store.doc().records(task)?.iterations.next_id();

            let mut data_idx = DataIdx::new();
            for (resolved, values) in plan.paths.iter().zip(&refs) {
                let i = chosen.get(&resolved.path).copied().unwrap_or(0);
                if let Some(r) = values.get(i) {
                    data_idx.insert(resolved.path.clone(), r.clone());
                }
            }
            for output in &plan.outputs {
                let id = self.store.add_parameter(
                    ParamData::Unset,
                    ParamSource::iteration_output(task, element_idx, iteration_idx),
                )?;
                data_idx.insert(output_path(output), id.into());
            }

            let iteration_idx =
                self.store
                    .add_iteration(task, Iteration::new(element_idx, data_idx, loop_idx.clone()))?;
            added.push((element_idx, iteration_idx));
        }
        log::info!("added {} elements to task {task}", added.len());
        Ok(added)
    }
}

fn source_key(source_type: TaskSourceType, param: &str) -> String {
    match source_type {
        TaskSourceType::Output => output_path(param),
        TaskSourceType::Input => input_path(param),
    }
}

fn source_ref(it: &Iteration, key: &str, upstream: InsertId, param: &str) -> Result<ParamRef> {
    it.data_idx.get(key).cloned().ok_or_else(|| {
        WorkflowError::InvalidInputSource {
            input: param.to_owned(),
            reason: format!("element {} of task {upstream} has no {key}", it.element_idx),
        }
        .into()
    })
}

/// Does `task` have `param` among its schema outputs (or inputs)?
fn provides(doc: &WorkflowDoc, task: InsertId, source_type: TaskSourceType, param: &str) -> bool {
    let Ok((stored, _)) = doc.task(task) else {
        return false;
    };
    doc.schemas(stored).iter().any(|s| match source_type {
        TaskSourceType::Output => s.has_output(param),
        TaskSourceType::Input => s.input(param).is_some(),
    })
}

fn check_nesting(path: &str, order: f64) -> Result<()> {
    if order < 0.0 {
        return Err(WorkflowError::TaskTemplateInvalidNesting {
            path: path.to_owned(),
            order,
        }
        .into());
    }
    Ok(())
}

/// Gather the values given directly in `set`, one entry per input parameter
/// or sub-parameter.
fn local_values(task: &TaskShape, set: &ElementSet) -> Result<BTreeMap<String, LocalValues>> {
    let mut local = BTreeMap::new();
    for input in &set.inputs {
        if !task.accepts(&input.parameter) {
            return Err(task.unexpected(&input.parameter).into());
        }
        let prev = local.insert(
            input.parameter.clone(),
            LocalValues {
                values: vec![input.value.clone()],
                nesting_order: None,
                sequence: false,
            },
        );
        if prev.is_some() {
            return Err(WorkflowError::TaskTemplateMultipleInputValues(input.parameter.clone()).into());
        }
    }
    for seq in &set.sequences {
        let param = match split_path(&seq.path) {
            Some((INPUTS, param)) if task.accepts(param) => param,
            _ => return Err(task.unexpected(&seq.path).into()),
        };
        if let Some(order) = seq.nesting_order {
            check_nesting(&seq.path, order)?;
        }
        let prev = local.insert(
            param.to_owned(),
            LocalValues {
                values: seq.values.clone(),
                nesting_order: seq.nesting_order,
                sequence: true,
            },
        );
        if prev.is_some() {
            return Err(WorkflowError::TaskTemplateMultipleInputValues(param.to_owned()).into());
        }
    }
    Ok(local)
}

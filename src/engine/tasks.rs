use std::collections::BTreeMap;

use anyhow::Result;

use store::{StoredTask, WorkflowDoc};
use workflow::{
    content_hash, ElementIdx, ElementPropagation, ElementSet, Error as WorkflowError, Errors,
    InsertId, IterIdx, TaskSchema, TaskTemplate,
};

use super::resolve::TaskShape;
use super::{Error, Workflow};

impl Workflow<'_> {
    /// Add a task at position `index` (default: last), with its element sets.
    ///
    /// Every element set is validated before anything is added; all validation
    /// failures are reported together.
    pub fn add_task(&mut self, template: TaskTemplate, index: Option<usize>) -> Result<InsertId> {
        self.batch_update(|wf| wf.add_task_inner(template, index))
    }

    fn add_task_inner(&mut self, template: TaskTemplate, index: Option<usize>) -> Result<InsertId> {
        let objective = check_objectives(&template.schemas)?;
        let doc = self.store.doc();
        let num_tasks = doc.template.tasks.len();
        let shape = TaskShape {
            insert_id: InsertId::new(doc.num_added_tasks),
            pos: index.unwrap_or(num_tasks).min(num_tasks),
            name: unique_name(doc, objective),
            schemas: template.schemas.clone(),
        };

        let sets = if template.element_sets.is_empty() {
            vec![ElementSet::default()]
        } else {
            template.element_sets
        };
        let mut errors = Errors::default();
        let mut plans = Vec::with_capacity(sets.len());
        for (i, set) in sets.into_iter().enumerate() {
            match self.plan_element_set(&shape, &set) {
                Ok(plan) => plans.push((set, plan)),
                Err(e) => errors.add_context(e, format!("element set {i}")),
            }
        }
        errors.into_result(&format!("adding task \"{}\"", shape.name))?;

        let keys = self.add_schemas(&template.schemas)?;
        log::info!("adding task \"{}\" ({} element sets)", shape.name, plans.len());
        self.store.add_task(
            shape.pos,
            StoredTask {
                insert_id: shape.insert_id,
                name: shape.name.clone(),
                schemas: keys,
                element_sets: Vec::new(),
                groups: template.groups,
            },
        );
        for (set, plan) in plans {
            log::debug!("task \"{}\": {} new elements", shape.name, plan.num_elements());
            self.apply_element_set(shape.insert_id, set, plan)?;
        }
        self.initialise_pending_ears()?;
        Ok(shape.insert_id)
    }

    /// Store schemas and their parameters as template components; returns the schema keys.
    fn add_schemas(&mut self, schemas: &[TaskSchema]) -> Result<Vec<String>> {
        let mut keys = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let key = content_hash(schema)?;
            self.store.add_component_schema(&key, schema);
            let params = schema.inputs.iter().map(|i| &i.parameter);
            for param in params.chain(schema.outputs.iter().map(|o| &o.parameter)) {
                self.store.add_component_parameter(param);
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Add an element set to an existing task, then propagate the new elements
    /// to downstream tasks as described by `propagate`.
    ///
    /// Each downstream task gets a copy of its first element set, sourcing only
    /// from the iterations just added upstream.
    pub fn add_elements(
        &mut self,
        task: InsertId,
        set: ElementSet,
        propagate: &[ElementPropagation],
    ) -> Result<Vec<ElementIdx>> {
        self.batch_update(|wf| {
            let added = wf.add_element_set(task, set)?;
            let new_iters: Vec<IterIdx> = added.iter().map(|(_, iter)| *iter).collect();

            for prop in propagate {
                let doc = wf.store.doc();
                let (downstream, _) = doc.task(prop.task)?;
                if doc.task_position(prop.task)? <= doc.task_position(task)? {
                    return Err(WorkflowError::InvalidInputSource {
                        input: downstream.name.clone(),
                        reason: format!("task {} is not downstream of task {task}", prop.task),
                    }
                    .into());
                }
                let mut ds_set = downstream.element_sets.first().cloned().unwrap_or_default();
                ds_set.nesting_order.extend(prop.nesting_order.clone());
                ds_set.sourceable_elem_iters = Some(BTreeMap::from([(task, new_iters.clone())]));
                log::debug!("propagating {} new elements to task {}", added.len(), prop.task);
                wf.add_element_set(prop.task, ds_set)?;
            }

            wf.initialise_pending_ears()?;
            Ok(added.into_iter().map(|(elem, _)| elem).collect())
        })
    }

    fn add_element_set(&mut self, task: InsertId, set: ElementSet) -> Result<Vec<(ElementIdx, IterIdx)>> {
        let shape = TaskShape::of(self.store.doc(), task)?;
        let plan = self.plan_element_set(&shape, &set)?;
        self.apply_element_set(task, set, plan)
    }
}

/// The single objective shared by all of a task's schemas.
fn check_objectives(schemas: &[TaskSchema]) -> Result<&str> {
    let first = schemas.first().ok_or(Error::TaskWithoutSchemas)?;
    let mut objectives: Vec<&str> = schemas.iter().map(|s| s.objective.as_str()).collect();
    objectives.dedup();
    if objectives.len() > 1 {
        return Err(WorkflowError::TaskTemplateMultipleSchemaObjectives(objectives.join(", ")).into());
    }
    Ok(&first.objective)
}

/// `objective`, or `objective_1`, `objective_2`, ... if already taken.
fn unique_name(doc: &WorkflowDoc, objective: &str) -> String {
    let taken = |name: &str| doc.template.tasks.iter().any(|t| t.name == name);
    if !taken(objective) {
        return objective.to_owned();
    }
    let mut n = 1;
    loop {
        let name = format!("{objective}_{n}");
        if !taken(&name) {
            return name;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(objective: &str) -> TaskSchema {
        TaskSchema {
            objective: objective.to_owned(),
            method: None,
            implementation: None,
            inputs: vec![],
            outputs: vec![],
            actions: vec![],
        }
    }

    #[test]
    fn objectives_must_agree() -> Result<()> {
        assert_eq!(check_objectives(&[schema("t1"), schema("t1")])?, "t1");
        let err = check_objectives(&[schema("t1"), schema("t2")]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::TaskTemplateMultipleSchemaObjectives(_))
        ));
        let err = check_objectives(&[]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::TaskWithoutSchemas)));
        Ok(())
    }

    #[test]
    fn repeated_objectives_get_suffixes() {
        let mut doc = WorkflowDoc::new("w");
        assert_eq!(unique_name(&doc, "t1"), "t1");
        for (i, name) in ["t1", "t1_1"].into_iter().enumerate() {
            doc.template.tasks.push(StoredTask {
                insert_id: InsertId::from(i),
                name: name.to_owned(),
                schemas: vec![],
                element_sets: vec![],
                groups: vec![],
            });
        }
        assert_eq!(unique_name(&doc, "t1"), "t1_2");
        assert_eq!(unique_name(&doc, "t2"), "t2");
    }
}

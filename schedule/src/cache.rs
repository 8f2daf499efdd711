use std::collections::BTreeSet;

use util::{HashMap, IdVec};
use workflow::{
    EarId, EarIdx, ElementId, ElementIdx, InsertId, IterIdx, IterationId, ParamId, ParamSource,
    TaskRecords,
};

type Edges = Vec<BTreeSet<usize>>;

/// Dependency relations between runs, iterations and elements of a whole workflow.
///
/// Built in one pass over every task. Runs, iterations and elements are addressed
/// by global indices, which flatten the per-task indices in task order; use the
/// lookup methods to convert to and from IDs.
#[derive(Debug, Default)]
pub struct DependencyCache {
    task_positions: HashMap<InsertId, usize>,
    run_offsets: Vec<usize>,
    iter_offsets: Vec<usize>,
    elem_offsets: Vec<usize>,

    run_ids: Vec<EarId>,
    iter_ids: Vec<IterationId>,
    elem_ids: Vec<ElementId>,
    run_iter: Vec<usize>,
    iter_elem: Vec<usize>,

    pub run_dependencies: Edges,
    pub run_dependents: Edges,
    /// Runs, of other iterations, that each iteration's runs depend on.
    pub iter_run_dependencies: Edges,
    pub iter_iter_dependencies: Edges,
    pub iter_iter_dependents: Edges,
    pub elem_iter_dependencies: Edges,
    pub elem_elem_dependencies: Edges,
    pub elem_elem_dependents: Edges,
    /// Transitive closure of `elem_elem_dependents`.
    pub elem_elem_dependents_rec: Edges,
}

impl DependencyCache {
    /// `tasks` must be in workflow task order.
    pub fn build(tasks: &[TaskRecords], sources: &IdVec<ParamId, ParamSource>) -> Self {
        let mut cache = Self::default();
        cache.index(tasks);

        let num_runs = cache.run_ids.len();
        cache.run_dependencies = vec![BTreeSet::new(); num_runs];
        for (pos, records) in tasks.iter().enumerate() {
            for (ear, run) in records.runs.enumerate() {
                let global = cache.run_offsets[pos] + usize::from(ear);
                for id in run.data_idx.values().flat_map(|r| r.ids().iter()) {
                    let producer = sources
                        .try_get(*id)
                        .and_then(ParamSource::originating_ear)
                        .and_then(|(task, ear)| cache.run_global(task, ear));
                    match producer {
                        Some(p) if p != global => {
                            cache.run_dependencies[global].insert(p);
                        }
                        _ => (),
                    }
                }
            }
        }
        cache.run_dependents = invert(&cache.run_dependencies);

        let num_iters = cache.iter_ids.len();
        cache.iter_run_dependencies = vec![BTreeSet::new(); num_iters];
        for (run, deps) in cache.run_dependencies.iter().enumerate() {
            let iter = cache.run_iter[run];
            cache.iter_run_dependencies[iter]
                .extend(deps.iter().filter(|&&d| cache.run_iter[d] != iter));
        }
        cache.iter_iter_dependencies = cache
            .iter_run_dependencies
            .iter()
            .map(|runs| runs.iter().map(|&r| cache.run_iter[r]).collect())
            .collect();
        cache.iter_iter_dependents = invert(&cache.iter_iter_dependencies);

        let num_elems = cache.elem_ids.len();
        cache.elem_iter_dependencies = vec![BTreeSet::new(); num_elems];
        for (iter, deps) in cache.iter_iter_dependencies.iter().enumerate() {
            let elem = cache.iter_elem[iter];
            cache.elem_iter_dependencies[elem]
                .extend(deps.iter().filter(|&&d| cache.iter_elem[d] != elem));
        }
        cache.elem_elem_dependencies = cache
            .elem_iter_dependencies
            .iter()
            .map(|iters| iters.iter().map(|&i| cache.iter_elem[i]).collect())
            .collect();
        cache.elem_elem_dependents = invert(&cache.elem_elem_dependencies);
        cache.elem_elem_dependents_rec = transitive_closure(&cache.elem_elem_dependents);

        log::debug!(
            "built dependency cache over {num_runs} runs, {num_iters} iterations, {num_elems} elements"
        );
        cache
    }

    fn index(&mut self, tasks: &[TaskRecords]) {
        for (pos, records) in tasks.iter().enumerate() {
            let task = records.insert_id;
            self.task_positions.insert(task, pos);
            self.run_offsets.push(self.run_ids.len());
            self.iter_offsets.push(self.iter_ids.len());
            self.elem_offsets.push(self.elem_ids.len());

            for (element_idx, _) in records.elements.enumerate() {
                self.elem_ids.push(ElementId {
                    task_insert_id: task,
                    element_idx,
                });
            }
            let elem_offset = self.elem_offsets[pos];
            for (iteration_idx, it) in records.iterations.enumerate() {
                self.iter_ids.push(IterationId {
                    task_insert_id: task,
                    element_idx: it.element_idx,
                    iteration_idx,
                });
                self.iter_elem.push(elem_offset + usize::from(it.element_idx));
            }
            let iter_offset = self.iter_offsets[pos];
            for (ear_idx, run) in records.runs.enumerate() {
                self.run_ids.push(EarId {
                    task_insert_id: task,
                    element_idx: run.element_idx,
                    iteration_idx: run.iteration_idx,
                    action_idx: run.action_idx,
                    run_idx: run.run_idx,
                    ear_idx,
                });
                self.run_iter.push(iter_offset + usize::from(run.iteration_idx));
            }
        }
    }
}

// LOOKUPS ////////////////////
impl DependencyCache {
    pub fn num_runs(&self) -> usize {
        self.run_ids.len()
    }

    pub fn num_iterations(&self) -> usize {
        self.iter_ids.len()
    }

    pub fn num_elements(&self) -> usize {
        self.elem_ids.len()
    }

    /// Global index of the run with task-wide index `ear` in `task`.
    pub fn run_global(&self, task: InsertId, ear: EarIdx) -> Option<usize> {
        let pos = *self.task_positions.get(&task)?;
        let global = self.run_offsets[pos] + usize::from(ear);
        (global < self.run_end(pos)).then_some(global)
    }

    pub fn iteration_global(&self, task: InsertId, iteration: IterIdx) -> Option<usize> {
        let pos = *self.task_positions.get(&task)?;
        let global = self.iter_offsets[pos] + usize::from(iteration);
        let end = self.iter_offsets.get(pos + 1).copied().unwrap_or(self.iter_ids.len());
        (global < end).then_some(global)
    }

    pub fn element_global(&self, task: InsertId, element: ElementIdx) -> Option<usize> {
        let pos = *self.task_positions.get(&task)?;
        let global = self.elem_offsets[pos] + usize::from(element);
        let end = self.elem_offsets.get(pos + 1).copied().unwrap_or(self.elem_ids.len());
        (global < end).then_some(global)
    }

    fn run_end(&self, pos: usize) -> usize {
        self.run_offsets.get(pos + 1).copied().unwrap_or(self.run_ids.len())
    }

    pub fn run_id(&self, global: usize) -> Option<&EarId> {
        self.run_ids.get(global)
    }

    pub fn iteration_id(&self, global: usize) -> Option<&IterationId> {
        self.iter_ids.get(global)
    }

    pub fn element_id(&self, global: usize) -> Option<&ElementId> {
        self.elem_ids.get(global)
    }

    /// Runs that `ear` takes inputs from.
    pub fn ear_dependencies(&self, ear: &EarId) -> Vec<EarId> {
        self.run_global(ear.task_insert_id, ear.ear_idx)
            .map(|g| self.run_ids_of(&self.run_dependencies[g]))
            .unwrap_or_default()
    }

    pub fn ear_dependents(&self, ear: &EarId) -> Vec<EarId> {
        self.run_global(ear.task_insert_id, ear.ear_idx)
            .map(|g| self.run_ids_of(&self.run_dependents[g]))
            .unwrap_or_default()
    }

    pub fn iteration_dependencies(&self, iteration: &IterationId) -> Vec<IterationId> {
        self.iteration_global(iteration.task_insert_id, iteration.iteration_idx)
            .map(|g| {
                self.iter_iter_dependencies[g]
                    .iter()
                    .map(|&i| self.iter_ids[i])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn element_dependencies(&self, element: &ElementId) -> Vec<ElementId> {
        self.element_lookup(element, &self.elem_elem_dependencies)
    }

    pub fn element_dependents(&self, element: &ElementId) -> Vec<ElementId> {
        self.element_lookup(element, &self.elem_elem_dependents)
    }

    /// Every element downstream of `element`, directly or not.
    pub fn element_dependents_rec(&self, element: &ElementId) -> Vec<ElementId> {
        self.element_lookup(element, &self.elem_elem_dependents_rec)
    }

    fn element_lookup(&self, element: &ElementId, edges: &Edges) -> Vec<ElementId> {
        self.element_global(element.task_insert_id, element.element_idx)
            .map(|g| edges[g].iter().map(|&e| self.elem_ids[e]).collect())
            .unwrap_or_default()
    }

    fn run_ids_of(&self, globals: &BTreeSet<usize>) -> Vec<EarId> {
        globals.iter().map(|&r| self.run_ids[r]).collect()
    }
}

fn invert(edges: &Edges) -> Edges {
    let mut inverted = vec![BTreeSet::new(); edges.len()];
    for (from, tos) in edges.iter().enumerate() {
        for &to in tos {
            inverted[to].insert(from);
        }
    }
    inverted
}

/// Repeatedly union each node's set with the sets of its members
/// until nothing changes. Nodes never appear in their own closure.
fn transitive_closure(edges: &Edges) -> Edges {
    let mut closure = edges.clone();
    loop {
        let mut changed = false;
        for node in 0..closure.len() {
            let mut reach = closure[node].clone();
            for &next in &closure[node] {
                reach.extend(closure[next].iter().copied());
            }
            reach.remove(&node);
            if reach.len() != closure[node].len() {
                closure[node] = reach;
                changed = true;
            }
        }
        if !changed {
            return closure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use workflow::{
        ActionIdx, DataIdx, Element, Iteration, ParamRef, Run, SourcePatch,
    };

    /// One element, one iteration and one run per task; each task's run reads
    /// the previous task's output.
    fn chain(len: u32) -> (Vec<TaskRecords>, IdVec<ParamId, ParamSource>) {
        let mut tasks = Vec::new();
        let mut sources = IdVec::default();
        for t in 0..len {
            let task = InsertId::new(t);
            let mut records = TaskRecords::new(task);
            records.elements.push(Element {
                element_set_idx: 0,
                seq_idx: BTreeMap::new(),
                input_sources: BTreeMap::new(),
                source_elements: BTreeMap::new(),
                iterations: vec![IterIdx::new(0)],
            });
            records
                .iterations
                .push(Iteration::new(ElementIdx::new(0), DataIdx::new(), BTreeMap::new()));

            let mut src = ParamSource::iteration_output(task, ElementIdx::new(0), IterIdx::new(0));
            src.apply(&SourcePatch {
                action_idx: ActionIdx::new(0),
                run_idx: 0,
                ear_idx: EarIdx::new(0),
            });
            let out = sources.push(src);

            let mut data_idx = DataIdx::new();
            data_idx.insert("outputs.p".to_owned(), ParamRef::One(out));
            if t > 0 {
                // previous task's output:
                data_idx.insert("inputs.p".to_owned(), ParamRef::One(ParamId::new(t - 1)));
            }
            records.runs.push(Run {
                element_idx: ElementIdx::new(0),
                iteration_idx: IterIdx::new(0),
                action_idx: ActionIdx::new(0),
                run_idx: 0,
                data_idx,
                submission_idx: None,
                start_time: None,
                end_time: None,
            });
            tasks.push(records);
        }
        (tasks, sources)
    }

    #[test]
    fn own_outputs_are_not_dependencies() {
        let (tasks, sources) = chain(3);
        let cache = DependencyCache::build(&tasks, &sources);
        for (i, deps) in cache.run_dependencies.iter().enumerate() {
            assert!(!deps.contains(&i));
        }
        for (i, deps) in cache.elem_elem_dependents_rec.iter().enumerate() {
            assert!(!deps.contains(&i));
        }
        assert!(cache.run_dependencies[0].is_empty());
        assert_eq!(cache.run_dependencies[2], BTreeSet::from([1]));
    }

    #[test]
    fn run_edges_lift_to_iterations_and_elements() {
        let (tasks, sources) = chain(4);
        let cache = DependencyCache::build(&tasks, &sources);
        for (run, deps) in cache.run_dependencies.iter().enumerate() {
            for &dep in deps {
                let (it, dep_it) = (cache.run_iter[run], cache.run_iter[dep]);
                assert!(cache.iter_iter_dependencies[it].contains(&dep_it));
                let (el, dep_el) = (cache.iter_elem[it], cache.iter_elem[dep_it]);
                assert!(cache.elem_elem_dependencies[el].contains(&dep_el));
                assert!(cache.elem_elem_dependents[dep_el].contains(&el));
            }
        }
    }

    #[test]
    fn closure_is_a_fixed_point() {
        let (tasks, sources) = chain(5);
        let cache = DependencyCache::build(&tasks, &sources);
        let rec = &cache.elem_elem_dependents_rec;
        assert_eq!(rec[0], BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(rec[3], BTreeSet::from([4]));
        assert!(rec[4].is_empty());
        // one more round of unions changes nothing:
        for (node, set) in rec.iter().enumerate() {
            let mut again = set.clone();
            for &n in set {
                again.extend(rec[n].iter().copied());
            }
            again.remove(&node);
            assert_eq!(&again, set);
        }
    }

    #[test]
    fn closure_handles_long_back_edges() {
        // 3 -> 2 -> 1 -> 0, listed so a single forward pass is not enough
        let edges = vec![
            BTreeSet::new(),
            BTreeSet::from([0]),
            BTreeSet::from([1]),
            BTreeSet::from([2]),
        ];
        let closure = transitive_closure(&edges);
        assert_eq!(closure[3], BTreeSet::from([0, 1, 2]));
    }

    #[test]
    fn lookups_translate_ids() {
        let (tasks, sources) = chain(3);
        let cache = DependencyCache::build(&tasks, &sources);
        let ear = *cache.run_id(2).unwrap();
        assert_eq!(ear.task_insert_id, InsertId::new(2));
        let deps = cache.ear_dependencies(&ear);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].task_insert_id, InsertId::new(1));
        assert_eq!(cache.ear_dependents(&deps[0]), vec![ear]);

        let first = ElementId {
            task_insert_id: InsertId::new(0),
            element_idx: ElementIdx::new(0),
        };
        assert_eq!(cache.element_dependents_rec(&first).len(), 2);
        assert!(cache.run_global(InsertId::new(7), EarIdx::new(0)).is_none());
        assert!(cache.run_global(InsertId::new(0), EarIdx::new(1)).is_none());
    }
}

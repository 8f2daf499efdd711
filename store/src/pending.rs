use std::collections::{BTreeMap, BTreeSet};

use workflow::{EarIdx, ElementIdx, InsertId, IterIdx, ParamId};

/// Changes buffered by the current batch, keyed by kind.
///
/// The staged document already contains these changes; the buckets record which
/// items changed so backends know what to write, and in which order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Pending {
    pub template_components: BTreeSet<String>,
    pub template_resources: bool,
    pub tasks: Vec<InsertId>,
    /// New element sets per task.
    pub element_sets: BTreeMap<InsertId, usize>,
    pub elements: BTreeMap<InsertId, BTreeSet<ElementIdx>>,
    /// Existing elements that gained iterations.
    pub element_iter_ids: BTreeMap<InsertId, BTreeSet<ElementIdx>>,
    pub iterations: BTreeMap<InsertId, BTreeSet<IterIdx>>,
    pub loop_idx: BTreeMap<InsertId, BTreeSet<IterIdx>>,
    pub ears: BTreeMap<InsertId, BTreeSet<EarIdx>>,
    /// Iterations whose EARs were initialised.
    pub iteration_ears: BTreeMap<InsertId, BTreeSet<IterIdx>>,
    pub loops: Vec<usize>,
    pub loop_iterations: BTreeSet<usize>,
    pub parameters: BTreeSet<ParamId>,
    pub parameter_sets: BTreeSet<ParamId>,
    pub source_patches: BTreeSet<ParamId>,
    pub submissions: Vec<usize>,
    /// Submissions whose dispatch records changed.
    pub submission_updates: BTreeSet<usize>,
    pub ear_submission_idx: BTreeMap<InsertId, BTreeSet<EarIdx>>,
    pub ear_times: BTreeMap<InsertId, BTreeSet<EarIdx>>,
    pub remove_replaced_dir: bool,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// True if anything in the metadata document changed.
    pub fn metadata_changed(&self) -> bool {
        !self.template_components.is_empty()
            || self.template_resources
            || !self.tasks.is_empty()
            || !self.element_sets.is_empty()
            || !self.loops.is_empty()
            || !self.loop_iterations.is_empty()
            || self.remove_replaced_dir
    }

    pub fn submissions_changed(&self) -> bool {
        !self.submissions.is_empty() || !self.submission_updates.is_empty()
    }

    pub fn dirty_elements(&self, task: InsertId) -> BTreeSet<ElementIdx> {
        union([&self.elements, &self.element_iter_ids], task)
    }

    pub fn dirty_iterations(&self, task: InsertId) -> BTreeSet<IterIdx> {
        union([&self.iterations, &self.loop_idx, &self.iteration_ears], task)
    }

    pub fn dirty_runs(&self, task: InsertId) -> BTreeSet<EarIdx> {
        union([&self.ears], task)
    }

    /// Runs whose submission index or timestamps changed.
    pub fn dirty_run_meta(&self, task: InsertId) -> BTreeSet<EarIdx> {
        union([&self.ear_submission_idx, &self.ear_times], task)
    }

    pub fn dirty_sources(&self) -> BTreeSet<ParamId> {
        self.parameters.union(&self.source_patches).copied().collect()
    }

    /// Tasks with any change to their collections.
    pub fn dirty_tasks(&self) -> BTreeSet<InsertId> {
        let mut tasks: BTreeSet<InsertId> = self.tasks.iter().copied().collect();
        for bucket in [&self.elements, &self.element_iter_ids] {
            tasks.extend(bucket.keys().copied());
        }
        for bucket in [&self.iterations, &self.loop_idx, &self.iteration_ears] {
            tasks.extend(bucket.keys().copied());
        }
        for bucket in [&self.ears, &self.ear_submission_idx, &self.ear_times] {
            tasks.extend(bucket.keys().copied());
        }
        tasks
    }

    pub(crate) fn mark<K: Ord + Copy>(
        bucket: &mut BTreeMap<InsertId, BTreeSet<K>>,
        task: InsertId,
        k: K,
    ) {
        bucket.entry(task).or_default().insert(k);
    }
}

fn union<const N: usize, K: Ord + Copy>(
    buckets: [&BTreeMap<InsertId, BTreeSet<K>>; N],
    task: InsertId,
) -> BTreeSet<K> {
    buckets
        .iter()
        .filter_map(|b| b.get(&task))
        .flat_map(|set| set.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_sets_merge_buckets() {
        let mut p = Pending::default();
        assert!(p.is_empty());
        let t = InsertId::new(0);
        Pending::mark(&mut p.iterations, t, IterIdx::new(3));
        Pending::mark(&mut p.iteration_ears, t, IterIdx::new(1));
        Pending::mark(&mut p.ear_times, InsertId::new(2), EarIdx::new(0));
        assert!(!p.is_empty());
        assert_eq!(
            p.dirty_iterations(t).into_iter().collect::<Vec<_>>(),
            vec![IterIdx::new(1), IterIdx::new(3)]
        );
        assert_eq!(p.dirty_tasks().len(), 2);
        assert!(!p.metadata_changed());
        p.clear();
        assert!(p.is_empty());
    }
}

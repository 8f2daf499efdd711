use std::collections::BTreeMap;

use anyhow::Result;

use workflow::{content_hash, EarIdx, EarStatus, IterIdx, Resources, Run, TaskRecords};

/// The EAR behind one cell of a resource map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarCell {
    pub ear_idx: EarIdx,
    pub run_idx: u32,
    pub iteration_idx: IterIdx,
}

/// Pending EARs of one task at one loop position, as an `[action][element]` grid.
#[derive(Debug, Clone, Default)]
pub struct ResourceMap {
    /// Distinct resources, indexed by resource ID.
    pub resources: Vec<Resources>,
    /// Content hash of each entry in `resources`.
    pub hashes: Vec<String>,
    /// `[action][element]` -> resource ID.
    pub matrix: Vec<Vec<Option<usize>>>,
    /// `[action][element]` -> EAR.
    pub ears: Vec<Vec<Option<EarCell>>>,
}

impl ResourceMap {
    pub fn is_empty(&self) -> bool {
        self.matrix.iter().flatten().all(Option::is_none)
    }

    /// Every occupied cell as (action, element, EAR).
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize, EarCell)> + '_ {
        self.ears.iter().enumerate().flat_map(|(action, row)| {
            row.iter()
                .enumerate()
                .filter_map(move |(elem, cell)| cell.map(|c| (action, elem, c)))
        })
    }
}

/// Collect the pending runs of `records` at `loop_idx`, deduplicating their resources.
///
/// Only iterations with initialised EARs are considered. `resources_of` gives the
/// resources a run will be submitted with.
pub fn generate_ear_resource_map(
    records: &TaskRecords,
    num_actions: usize,
    loop_idx: &BTreeMap<String, u32>,
    mut resources_of: impl FnMut(EarIdx, &Run) -> Result<Resources>,
) -> Result<ResourceMap> {
    let num_elements = records.elements.len();
    let mut map = ResourceMap {
        resources: Vec::new(),
        hashes: Vec::new(),
        matrix: vec![vec![None; num_elements]; num_actions],
        ears: vec![vec![None; num_elements]; num_actions],
    };
    // canonical JSON -> resource ID
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();

    for (element_idx, element) in records.elements.enumerate() {
        let elem = usize::from(element_idx);
        for &iteration_idx in &element.iterations {
            let iteration = records.iterations.get(iteration_idx);
            if !iteration.ears_initialised || !iteration.matches_loop_idx(loop_idx) {
                continue;
            }
            for (&action_idx, ears) in &iteration.actions {
                let action = usize::from(action_idx);
                if action >= num_actions {
                    continue;
                }
                for &ear_idx in ears {
                    let run = records.runs.get(ear_idx);
                    if run.status(|_| false) != EarStatus::Pending {
                        continue;
                    }
                    let resources = resources_of(ear_idx, run)?;
                    let canonical = serde_json::to_string(&resources)?;
                    let id = match seen.get(&canonical) {
                        Some(&id) => id,
                        None => {
                            let id = map.resources.len();
                            map.hashes.push(content_hash(&resources)?);
                            map.resources.push(resources);
                            seen.insert(canonical, id);
                            id
                        }
                    };
                    map.matrix[action][elem] = Some(id);
                    map.ears[action][elem] = Some(EarCell {
                        ear_idx,
                        run_idx: run.run_idx,
                        iteration_idx,
                    });
                }
            }
        }
    }
    log::trace!(
        "task {}: {} distinct resources across {} actions",
        records.insert_id,
        map.resources.len(),
        num_actions
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow::{ActionIdx, DataIdx, Element, ElementIdx, InsertId, Iteration};

    fn run(elem: u32, iter: u32, action: u32) -> Run {
        Run {
            element_idx: ElementIdx::new(elem),
            iteration_idx: IterIdx::new(iter),
            action_idx: ActionIdx::new(action),
            run_idx: 0,
            data_idx: DataIdx::new(),
            submission_idx: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Two elements with two actions each; the second element's actions need 4 cores.
    fn records() -> TaskRecords {
        let mut records = TaskRecords::new(InsertId::new(0));
        for e in 0..2u32 {
            records.elements.push(Element {
                element_set_idx: 0,
                seq_idx: BTreeMap::new(),
                input_sources: BTreeMap::new(),
                source_elements: BTreeMap::new(),
                iterations: vec![IterIdx::new(e)],
            });
            let mut it = Iteration::new(ElementIdx::new(e), DataIdx::new(), BTreeMap::new());
            it.ears_initialised = true;
            for a in 0..2u32 {
                let ear = records.runs.push(run(e, e, a));
                it.actions.insert(ActionIdx::new(a), vec![ear]);
            }
            records.iterations.push(it);
        }
        records
    }

    fn cores(run: &Run) -> Resources {
        let mut res = Resources::default();
        let n = if run.element_idx == ElementIdx::new(1) { 4 } else { 1 };
        res.insert("num_cores", serde_json::json!(n));
        res
    }

    #[test]
    fn identical_resources_share_an_id() -> Result<()> {
        let map = generate_ear_resource_map(&records(), 2, &BTreeMap::new(), |_, r| Ok(cores(r)))?;
        assert_eq!(map.resources.len(), 2);
        assert_eq!(map.matrix, vec![vec![Some(0), Some(1)], vec![Some(0), Some(1)]]);
        assert_ne!(map.hashes[0], map.hashes[1]);
        assert_eq!(map.cells().count(), 4);
        Ok(())
    }

    #[test]
    fn only_pending_runs_are_mapped() -> Result<()> {
        let mut records = records();
        records.runs.get_mut(EarIdx::new(0)).submission_idx = Some(0);
        let map = generate_ear_resource_map(&records, 2, &BTreeMap::new(), |_, r| Ok(cores(r)))?;
        assert_eq!(map.matrix[0][0], None);
        assert_eq!(map.matrix[1][0], Some(0));

        records.iterations.get_mut(IterIdx::new(1)).ears_initialised = false;
        let map = generate_ear_resource_map(&records, 2, &BTreeMap::new(), |_, r| Ok(cores(r)))?;
        assert_eq!(map.matrix[0][1], None);
        assert_eq!(map.matrix[1][1], None);
        Ok(())
    }

    #[test]
    fn other_loop_iterations_are_skipped() -> Result<()> {
        let records = records();
        let loop_idx = BTreeMap::from([("outer".to_owned(), 1)]);
        let map = generate_ear_resource_map(&records, 2, &loop_idx, |_, r| Ok(cores(r)))?;
        assert!(map.is_empty());
        Ok(())
    }
}

use std::collections::{BTreeMap, BTreeSet};

use workflow::{ActionIdx, InsertId, Jobscript, TaskAction};

use crate::{Error, ResourceMap};

/// A set of resource-map cells that will become one jobscript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGroup {
    pub resource: usize,
    /// Element (column) -> ascending action rows.
    pub elements: BTreeMap<usize, Vec<usize>>,
}

/// Partition a `[action][element]` resource matrix into groups of equal resources.
///
/// Rows are visited in order, and within each row the resource IDs present in it
/// in ascending order. For a row and resource, every column whose cell in that row
/// is unallocated and either holds the resource or is empty starts a walk down the
/// column, collecting cells with that resource and stepping over empty ones. The
/// walk stops at the first cell holding another resource or already allocated.
pub fn group_resource_map(matrix: &[Vec<Option<usize>>]) -> anyhow::Result<Vec<CellGroup>> {
    let num_cols = matrix.first().map_or(0, Vec::len);
    if let Some(row) = matrix.iter().position(|r| r.len() != num_cols) {
        return Err(Error::RaggedResourceMap { row, expected: num_cols }.into());
    }

    let mut remaining = matrix.iter().flatten().filter(|c| c.is_some()).count();
    let mut allocated = vec![vec![false; num_cols]; matrix.len()];
    let mut groups = Vec::new();

    for (row_idx, row) in matrix.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let resources: BTreeSet<usize> = row.iter().flatten().copied().collect();
        for res in resources {
            let mut elements: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for col in 0..num_cols {
                if allocated[row_idx][col] || row[col].is_some_and(|r| r != res) {
                    continue;
                }
                let mut rows = Vec::new();
                if row[col].is_some() {
                    rows.push(row_idx);
                }
                for (ds_idx, ds_row) in matrix.iter().enumerate().skip(row_idx + 1) {
                    match ds_row[col] {
                        None => continue,
                        Some(r) if r == res && !allocated[ds_idx][col] => rows.push(ds_idx),
                        Some(_) => break,
                    }
                }
                if !rows.is_empty() {
                    elements.insert(col, rows);
                }
            }
            if elements.is_empty() {
                continue;
            }
            for (&col, rows) in &elements {
                for &r in rows {
                    allocated[r][col] = true;
                    remaining -= 1;
                }
            }
            groups.push(CellGroup {
                resource: res,
                elements,
            });
            if remaining == 0 {
                break;
            }
        }
    }
    Ok(groups)
}

/// Turn the groups of one task's resource map into single-task jobscripts.
pub fn build_jobscripts(
    task: InsertId,
    loop_idx: &BTreeMap<String, u32>,
    map: &ResourceMap,
    groups: &[CellGroup],
) -> Vec<Jobscript> {
    groups
        .iter()
        .map(|group| {
            let actions: BTreeSet<usize> = group.elements.values().flatten().copied().collect();
            let actions: Vec<usize> = actions.into_iter().collect();
            let columns: Vec<usize> = group.elements.keys().copied().collect();

            let ear_idx = actions
                .iter()
                .map(|&action| {
                    columns
                        .iter()
                        .map(|col| {
                            let included = group.elements[col].contains(&action);
                            included
                                .then(|| map.ears[action][*col].map(|c| c.ear_idx))
                                .flatten()
                        })
                        .collect()
                })
                .collect();

            Jobscript {
                task_insert_ids: vec![task],
                task_loop_idx: vec![loop_idx.clone()],
                task_actions: actions
                    .iter()
                    .map(|&a| TaskAction {
                        task_insert_id: task,
                        action_idx: ActionIdx::from(a),
                        loop_idx_pos: 0,
                    })
                    .collect(),
                task_elements: BTreeMap::from([(task, columns.iter().map(|&c| c.into()).collect())]),
                ear_idx,
                resources: map.resources[group.resource].clone(),
                resource_hash: map.hashes[group.resource].clone(),
                dependencies: BTreeMap::new(),
                submit_time: None,
                scheduler_job_ref: None,
            }
        })
        .collect()
}

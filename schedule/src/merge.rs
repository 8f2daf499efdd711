use std::collections::{BTreeMap, BTreeSet};

use workflow::{Jobscript, JobscriptDependency, TaskAction};

use crate::dependencies::is_array;

/// Merge each jobscript that has a single array dependency on a jobscript with the
/// same resources into that jobscript. Merged-away slots are left as `None`.
pub fn merge_jobscripts_across_tasks(jobscripts: Vec<Jobscript>) -> Vec<Option<Jobscript>> {
    let mut slots: Vec<Option<Jobscript>> = jobscripts.into_iter().map(Some).collect();

    for idx in 0..slots.len() {
        let Some((target_idx, perm)) = merge_target(&slots, idx) else {
            continue;
        };
        let Some(js) = slots[idx].take() else {
            continue;
        };
        let Some(target) = slots[target_idx].as_mut() else {
            continue;
        };
        log::debug!("merging jobscript {idx} into jobscript {target_idx}");
        absorb(target, js, &perm);
        let target_len = target.num_elements();

        // anything downstream of the merged jobscript now depends on the target:
        for ds in slots.iter_mut().skip(idx + 1).flatten() {
            let Some(dep) = ds.dependencies.remove(&idx) else {
                continue;
            };
            let entry = ds.dependencies.entry(target_idx).or_default();
            for (col, cols) in dep.js_element_mapping {
                let merged = entry.js_element_mapping.entry(col).or_default();
                let mut set: BTreeSet<usize> = merged.iter().copied().collect();
                set.extend(cols.iter().map(|&c| perm[c]));
                *merged = set.into_iter().collect();
            }
            let len = ds.num_elements();
            if let Some(entry) = ds.dependencies.get_mut(&target_idx) {
                entry.is_array = is_array(&entry.js_element_mapping, len, target_len);
            }
        }
    }
    slots
}

/// The jobscript `idx` can merge into, with the column permutation
/// (merged column -> target column) given by the array dependency.
fn merge_target(slots: &[Option<Jobscript>], idx: usize) -> Option<(usize, Vec<usize>)> {
    let js = slots[idx].as_ref()?;
    if js.dependencies.len() != 1 {
        return None;
    }
    let (&target_idx, dep) = js.dependencies.iter().next()?;
    let target = slots.get(target_idx)?.as_ref()?;
    if !dep.is_array || target.resource_hash != js.resource_hash {
        return None;
    }
    let perm: Vec<usize> = (0..js.num_elements())
        .map(|col| dep.js_element_mapping.get(&col).and_then(|m| m.first().copied()))
        .collect::<Option<_>>()?;

    // a task can only appear once, unless its elements line up exactly:
    for (task, elems) in &js.task_elements {
        if let Some(existing) = target.task_elements.get(task) {
            if permute(elems, &perm, target.num_elements()).as_ref() != Some(existing) {
                return None;
            }
        }
    }
    Some((target_idx, perm))
}

/// Reorder `items` so the item in column `c` ends up in column `perm[c]`.
fn permute<T: Clone>(items: &[T], perm: &[usize], len: usize) -> Option<Vec<T>> {
    let mut out: Vec<Option<T>> = vec![None; len];
    for (col, item) in items.iter().enumerate() {
        *out.get_mut(*perm.get(col)?)? = Some(item.clone());
    }
    out.into_iter().collect()
}

fn absorb(target: &mut Jobscript, js: Jobscript, perm: &[usize]) {
    let len = target.num_elements();
    let loop_offset = target.task_loop_idx.len();
    target.task_loop_idx.extend(js.task_loop_idx);
    target
        .task_actions
        .extend(js.task_actions.into_iter().map(|ta| TaskAction {
            loop_idx_pos: ta.loop_idx_pos + loop_offset,
            ..ta
        }));
    for task in js.task_insert_ids {
        if !target.task_insert_ids.contains(&task) {
            target.task_insert_ids.push(task);
        }
    }
    for (task, elems) in js.task_elements {
        if let Some(permuted) = permute(&elems, perm, len) {
            target.task_elements.insert(task, permuted);
        }
    }
    for row in js.ear_idx {
        target
            .ear_idx
            .push(permute(&row, perm, len).unwrap_or_else(|| vec![None; len]));
    }
}

/// Drop merged-away slots and renumber dependencies to list positions.
pub fn jobscripts_to_list(slots: Vec<Option<Jobscript>>) -> Vec<Jobscript> {
    let mut new_idx: BTreeMap<usize, usize> = BTreeMap::new();
    for (old, slot) in slots.iter().enumerate() {
        if slot.is_some() {
            new_idx.insert(old, new_idx.len());
        }
    }
    slots
        .into_iter()
        .flatten()
        .map(|mut js| {
            js.dependencies = std::mem::take(&mut js.dependencies)
                .into_iter()
                .filter_map(|(old, dep): (usize, JobscriptDependency)| {
                    new_idx.get(&old).map(|&new| (new, dep))
                })
                .collect();
            js
        })
        .collect()
}

use std::collections::{BTreeMap, BTreeSet};

use util::HashMap;
use workflow::{EarIdx, InsertId, Jobscript, JobscriptDependency};

use crate::DependencyCache;

/// Record, on each jobscript, which earlier jobscripts hold the EARs it depends on.
pub fn resolve_jobscript_dependencies(jobscripts: &mut [Jobscript], cache: &DependencyCache) {
    // (task, EAR) -> (jobscript, column)
    let mut location: HashMap<(InsertId, EarIdx), (usize, usize)> = HashMap::default();
    for (js_idx, js) in jobscripts.iter().enumerate() {
        for (row, col, ear) in js.cells() {
            location.insert((js.task_actions[row].task_insert_id, ear), (js_idx, col));
        }
    }

    for js_idx in 0..jobscripts.len() {
        let mut mappings: BTreeMap<usize, BTreeMap<usize, BTreeSet<usize>>> = BTreeMap::new();
        let js = &jobscripts[js_idx];
        for (row, col, ear) in js.cells() {
            let task = js.task_actions[row].task_insert_id;
            let Some(global) = cache.run_global(task, ear) else {
                continue;
            };
            for &dep in &cache.run_dependencies[global] {
                let Some(dep_id) = cache.run_id(dep) else {
                    continue;
                };
                match location.get(&(dep_id.task_insert_id, dep_id.ear_idx)) {
                    // producers are always resolved first:
                    Some(&(dep_js, dep_col)) if dep_js < js_idx => {
                        mappings
                            .entry(dep_js)
                            .or_default()
                            .entry(col)
                            .or_default()
                            .insert(dep_col);
                    }
                    _ => (),
                }
            }
        }

        let num_elements = js.num_elements();
        let dependencies = mappings
            .into_iter()
            .map(|(dep_js, mapping)| {
                let js_element_mapping: BTreeMap<usize, Vec<usize>> = mapping
                    .into_iter()
                    .map(|(col, cols)| (col, cols.into_iter().collect()))
                    .collect();
                let is_array = is_array(
                    &js_element_mapping,
                    num_elements,
                    jobscripts[dep_js].num_elements(),
                );
                (
                    dep_js,
                    JobscriptDependency {
                        js_element_mapping,
                        is_array,
                    },
                )
            })
            .collect();
        jobscripts[js_idx].dependencies = dependencies;
    }
}

/// True if `mapping` pairs each of the `num_elements` dependent elements with
/// exactly one of the `num_dep_elements` producer elements, and covers all of them.
pub fn is_array(
    mapping: &BTreeMap<usize, Vec<usize>>,
    num_elements: usize,
    num_dep_elements: usize,
) -> bool {
    let all_dependent = mapping.keys().copied().eq(0..num_elements);
    let all_single = mapping.values().all(|cols| cols.len() == 1);
    let producers: BTreeSet<usize> = mapping.values().flatten().copied().collect();
    all_dependent && all_single && producers.into_iter().eq(0..num_dep_elements)
}

use std::collections::BTreeMap;

use workflow::{InsertId, Loop};

/// One visit of a task, at a particular position in every loop containing it.
pub type PathwayStep = (InsertId, BTreeMap<String, u32>);

/// Unroll the loops over `tasks` into the order tasks are visited in.
///
/// Each loop, in turn, replaces the span of the pathway holding its tasks with
/// that span repeated once per added iteration, tagging each repeat with the
/// loop's name and iteration number.
pub fn iteration_task_pathway(tasks: &[InsertId], loops: &[Loop]) -> Vec<PathwayStep> {
    let mut pathway: Vec<PathwayStep> = tasks.iter().map(|&t| (t, BTreeMap::new())).collect();

    for lp in loops {
        let subset: Vec<usize> = pathway
            .iter()
            .enumerate()
            .filter(|(_, (task, _))| lp.tasks.contains(task))
            .map(|(i, _)| i)
            .collect();
        let (Some(&first), Some(&last)) = (subset.first(), subset.last()) else {
            continue;
        };

        let mut looped = Vec::with_capacity(subset.len() * lp.num_added_iterations as usize);
        for iter in 0..lp.num_added_iterations {
            for &i in &subset {
                let (task, mut loop_idx) = pathway[i].clone();
                loop_idx.insert(lp.name.clone(), iter);
                looped.push((task, loop_idx));
            }
        }
        pathway.splice(first..=last, looped);
    }
    pathway
}

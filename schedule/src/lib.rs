//! Dependency analysis and jobscript scheduling.
//!
//! Jobscripts are resolved in four stages:
//! 1. For each task at each loop position, map its pending EARs to their resources
//!    ([`generate_ear_resource_map`]).
//! 2. Partition each map into groups of cells with equal resources ([`group_resource_map`]),
//!    each becoming a single-task jobscript ([`build_jobscripts`]).
//! 3. Link jobscripts whose EARs depend on EARs in earlier jobscripts
//!    ([`resolve_jobscript_dependencies`]), using a [`DependencyCache`].
//! 4. Merge jobscripts into the jobscript they depend on, where resources match and
//!    the dependency is one-to-one, then renumber the survivors
//!    ([`merge_jobscripts_across_tasks`], [`jobscripts_to_list`]).
//!
//! Stage 1 needs to know the resources of each EAR, which callers provide.

use std::collections::BTreeMap;

use anyhow::Result;

use workflow::{InsertId, Jobscript};

mod cache;
pub use cache::DependencyCache;

mod resource_map;
pub use resource_map::{generate_ear_resource_map, EarCell, ResourceMap};

mod partition;
pub use partition::{build_jobscripts, group_resource_map, CellGroup};

mod dependencies;
pub use dependencies::{is_array, resolve_jobscript_dependencies};

mod merge;
pub use merge::{jobscripts_to_list, merge_jobscripts_across_tasks};

mod pathway;
pub use pathway::{iteration_task_pathway, PathwayStep};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Resource map row {row} does not have {expected} columns")]
    RaggedResourceMap { row: usize, expected: usize },
}

/// Run stages 2 to 4 over resource maps already generated for each pathway step.
pub fn resolve_jobscripts(
    maps: &[(InsertId, BTreeMap<String, u32>, ResourceMap)],
    cache: &DependencyCache,
) -> Result<Vec<Jobscript>> {
    let mut jobscripts = Vec::new();
    for (task, loop_idx, map) in maps {
        if map.is_empty() {
            continue;
        }
        let groups = group_resource_map(&map.matrix)?;
        log::debug!("task {task} {loop_idx:?}: {} jobscripts", groups.len());
        jobscripts.extend(build_jobscripts(*task, loop_idx, map, &groups));
    }
    resolve_jobscript_dependencies(&mut jobscripts, cache);
    let list = jobscripts_to_list(merge_jobscripts_across_tasks(jobscripts));
    log::info!("resolved {} jobscripts", list.len());
    Ok(list)
}

//! Ids for use in typed collections.

use serde::{Deserialize, Serialize};

macro_rules! id {
    ($name:ident, $ty:ty) => {
        #[derive(
            Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($ty);

        impl $name {
            pub const fn new(val: $ty) -> Self {
                Self(val)
            }
        }

        impl From<$name> for usize {
            fn from(id: $name) -> usize {
                id.0 as usize
            }
        }

        impl From<usize> for $name {
            fn from(val: usize) -> $name {
                Self(val as $ty)
            }
        }

        impl From<$name> for $ty {
            fn from(id: $name) -> $ty {
                id.0
            }
        }

        impl From<$ty> for $name {
            fn from(val: $ty) -> $name {
                Self(val)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// insert ids are never reused, even if tasks are later inserted before existing ones.
id!(InsertId, u32);
// element index within its task.
id!(ElementIdx, u32);
// iteration index within its task (not within its element).
id!(IterIdx, u32);
// action index across all schemas of a task, in declaration order.
id!(ActionIdx, u32);
// task-wide sequential EAR index.
id!(EarIdx, u32);
id!(ParamId, u32);

/// Identifies an element.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    pub task_insert_id: InsertId,
    pub element_idx: ElementIdx,
}

/// Identifies an element iteration. `iteration_idx` is the task-wide iteration index.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IterationId {
    pub task_insert_id: InsertId,
    pub element_idx: ElementIdx,
    pub iteration_idx: IterIdx,
}

/// Full identity of an element-action-run.
///
/// This is also what a running job receives (as positional args) when it calls back
/// into the engine, so the field order is fixed.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EarId {
    pub task_insert_id: InsertId,
    pub element_idx: ElementIdx,
    pub iteration_idx: IterIdx,
    pub action_idx: ActionIdx,
    pub run_idx: u32,
    pub ear_idx: EarIdx,
}

impl EarId {
    pub fn iteration(&self) -> IterationId {
        IterationId {
            task_insert_id: self.task_insert_id,
            element_idx: self.element_idx,
            iteration_idx: self.iteration_idx,
        }
    }

    pub fn element(&self) -> ElementId {
        ElementId {
            task_insert_id: self.task_insert_id,
            element_idx: self.element_idx,
        }
    }
}

impl IterationId {
    pub fn element(&self) -> ElementId {
        ElementId {
            task_insert_id: self.task_insert_id,
            element_idx: self.element_idx,
        }
    }
}

impl std::fmt::Display for EarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.task_insert_id,
            self.element_idx,
            self.iteration_idx,
            self.action_idx,
            self.run_idx,
            self.ear_idx
        )
    }
}

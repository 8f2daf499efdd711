use std::path::Path;

use anyhow::{Context as _, Result};

use store::{Store, WorkflowDoc};
use workflow::{EarId, InsertId, WorkflowTemplate};

use crate::context::Context;

/// Adding tasks and element sets
mod tasks;
/// Expanding element sets into elements
mod resolve;
/// EAR initialisation
mod ears;
/// Adding loops and loop iterations
mod loops;
/// Read-only views of elements, iterations and EARs
mod lookup;
pub use lookup::{Ear, ElementIteration, ElementView};
/// Jobscripts, submissions and job call-backs
mod submit;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("A task needs at least one schema")]
    TaskWithoutSchemas,
    #[error("A loop named \"{0}\" already exists")]
    LoopExists(String),
    #[error("No loop named \"{0}\"")]
    UnknownLoop(String),
    #[error("Task {0} has no action {1}")]
    UnknownAction(InsertId, usize),
    #[error(
        "Jobscript {js} of submission {sub} has no EAR at element {element}, action {action}"
    )]
    JobscriptCellEmpty {
        sub: usize,
        js: usize,
        element: usize,
        action: usize,
    },
    #[error("No prepared submissions to submit")]
    NothingToSubmit,
    #[error("Jobscript {1} of submission {0} depends on jobscript {2}, which was not submitted")]
    DependencyNotSubmitted(usize, usize, usize),
    #[error("EAR {0} has no output \"{1}\"")]
    UnknownOutput(EarId, String),
}

/// A persisted workflow, open for reading and modification.
///
/// All modifications happen inside [`Workflow::batch_update`]; the public
/// mutating methods each open a batch of their own, which joins any batch
/// already in progress.
pub struct Workflow<'ctx> {
    ctx: &'ctx Context,
    store: Store,
    in_batch: bool,
}

impl std::fmt::Debug for Workflow<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("in_batch", &self.in_batch)
            .finish_non_exhaustive()
    }
}

impl<'ctx> Workflow<'ctx> {
    /// Create a workflow at `path` and add the template's tasks and loops to it.
    ///
    /// If anything fails, the new directory is removed again (and whatever it
    /// replaced, with `overwrite`, is put back).
    pub fn create(
        ctx: &'ctx Context,
        template: &WorkflowTemplate,
        path: &Path,
        overwrite: bool,
    ) -> Result<Self> {
        log::info!("creating workflow \"{}\" at {}", template.name, path.display());
        let store = Store::create(path, &template.name, &ctx.create_options(overwrite))?;
        let mut wf = Self {
            ctx,
            store,
            in_batch: false,
        };
        wf.batch_update(|wf| {
            wf.store.set_template_resources(template.resources.clone());
            for task in &template.tasks {
                wf.add_task(task.clone(), None)?;
            }
            for lp in &template.loops {
                wf.add_loop(lp.clone())?;
            }
            Ok(())
        })
        .with_context(|| format!("creating workflow \"{}\"", template.name))?;
        Ok(wf)
    }

    pub fn open(ctx: &'ctx Context, path: &Path) -> Result<Self> {
        let store = Store::open(path, &ctx.retry())?;
        log::debug!("opened {} workflow at {}", store.format(), path.display());
        Ok(Self {
            ctx,
            store,
            in_batch: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn name(&self) -> &str {
        &self.store.doc().template.name
    }

    /// The current document, including changes made by an open batch.
    pub fn doc(&self) -> &WorkflowDoc {
        self.store.doc()
    }

    /// Re-read the persisted state, picking up changes made by other processes.
    pub fn reload(&mut self) -> Result<()> {
        self.store.reload()
    }

    pub fn task_by_name(&self, name: &str) -> Option<InsertId> {
        self.doc()
            .template
            .tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.insert_id)
    }

    /// Run `f` as one unit of work.
    ///
    /// Changes are committed if `f` succeeds, and discarded entirely if it
    /// fails or if the workflow was changed on disk in the meantime. Nested
    /// calls run inline, as part of the outermost batch.
    pub fn batch_update<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.in_batch {
            return f(self);
        }
        self.in_batch = true;
        let result = f(self);
        self.in_batch = false;

        match result {
            Ok(val) => {
                self.store.commit()?;
                Ok(val)
            }
            Err(e) => {
                log::debug!("batch failed, rejecting pending changes: {e:#}");
                self.store
                    .reject()
                    .context("discarding pending changes after a failed batch")?;
                Err(e.context("pending changes discarded"))
            }
        }
    }
}

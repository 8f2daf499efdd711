use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use util::RetryPolicy;
use workflow::{
    ActionIdx, EarIdx, Element, ElementIdx, ElementSet, InsertId, IterIdx, Iteration, Loop,
    ParamData, ParamId, ParamRef, ParamSource, ResourceSpec, Run, SourcePatch, Submission,
    TaskRecords, TaskSchema,
};

use crate::{Backend, Error, Fs, Pending, StoreFormat, StoredTask, WorkflowDoc};

/// Transactional access to a persisted workflow.
///
/// Reads see the staged document: the last committed state plus every change
/// made since. `commit` flushes the changes through the backend, unless the
/// on-disk state changed underneath us, in which case the changes are discarded.
pub struct Store {
    path: PathBuf,
    /// Rooted at the parent dir; only used to swap whole workflow dirs in and out.
    parent_fs: Fs,
    backend: Box<dyn Backend>,
    committed: WorkflowDoc,
    staged: WorkflowDoc,
    pending: Pending,
    fingerprint: String,
    /// True until the first commit of a newly created workflow.
    creating: bool,
}

pub struct CreateOptions {
    pub format: StoreFormat,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    /// Move an existing directory at the target path out of the way.
    pub overwrite: bool,
}

impl Store {
    /// Create a new, empty workflow at `path`.
    ///
    /// If `path` exists and overwriting is allowed, it is renamed to a sibling
    /// and only deleted once the first commit succeeds.
    pub fn create(path: &Path, name: &str, opts: &CreateOptions) -> Result<Self> {
        let parent_fs = Fs::new(&parent_dir(path), opts.retry);
        let mut doc = WorkflowDoc::new(name);

        if path.exists() {
            if !opts.overwrite {
                return Err(Error::WorkflowExists(path.to_path_buf()).into());
            }
            let replaced = replaced_path(path);
            log::info!("moving existing {} to {}", path.display(), replaced.display());
            parent_fs.rename(path, &replaced)?;
            doc.replaced_dir = Some(replaced);
        }

        let fs = Fs::new(path, opts.retry);
        let mut backend = opts.format.backend(fs, opts.chunk_size);
        if let Err(e) = backend.initialise(&doc) {
            restore_replaced(&parent_fs, path, doc.replaced_dir.as_deref())?;
            return Err(e);
        }
        let fingerprint = backend.fingerprint()?;
        log::debug!("created {} workflow at {}", opts.format, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            parent_fs,
            backend,
            committed: doc.clone(),
            staged: doc,
            pending: Pending::default(),
            fingerprint,
            creating: true,
        })
    }

    /// Open an existing workflow, detecting its format.
    pub fn open(path: &Path, retry: &RetryPolicy) -> Result<Self> {
        let format = StoreFormat::detect(path)?;
        let fs = Fs::new(path, *retry);
        let mut backend = format.backend(fs, 1);
        let doc = backend
            .load()
            .with_context(|| format!("loading workflow from {}", path.display()))?;
        let fingerprint = backend.fingerprint()?;
        Ok(Self {
            path: path.to_path_buf(),
            parent_fs: Fs::new(&parent_dir(path), *retry),
            backend,
            committed: doc.clone(),
            staged: doc,
            pending: Pending::default(),
            fingerprint,
            creating: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> StoreFormat {
        self.backend.format()
    }

    /// The staged document.
    pub fn doc(&self) -> &WorkflowDoc {
        &self.staged
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Discard pending changes and re-read the persisted state.
    pub fn reload(&mut self) -> Result<()> {
        self.reject()?;
        let doc = self.backend.load()?;
        self.fingerprint = self.backend.fingerprint()?;
        self.committed = doc.clone();
        self.staged = doc;
        Ok(())
    }

    /// Flush pending changes.
    ///
    /// Fails with [`Error::WorkflowBatchUpdateFailed`] and discards the changes
    /// if the persisted state was modified since it was loaded.
    pub fn commit(&mut self) -> Result<()> {
        let replaced = if self.creating {
            self.staged.replaced_dir.take()
        } else {
            None
        };
        if replaced.is_some() {
            self.pending.remove_replaced_dir = true;
        }

        if self.pending.is_empty() {
            self.creating = false;
            return Ok(());
        }

        let current = self.backend.fingerprint()?;
        if current != self.fingerprint {
            log::warn!(
                "workflow at {} was modified by another process; discarding changes",
                self.path.display()
            );
            self.staged.replaced_dir = replaced;
            self.reject()?;
            return Err(Error::WorkflowBatchUpdateFailed(self.path.clone()).into());
        }

        if let Err(e) = self.backend.commit(&self.staged, &self.pending) {
            log::error!("commit to {} failed: {e:#}", self.path.display());
            self.staged.replaced_dir = replaced;
            self.reject()?;
            return Err(e);
        }

        self.committed = self.staged.clone();
        self.pending.clear();
        self.fingerprint = self.backend.fingerprint()?;
        self.creating = false;

        if let Some(dir) = replaced {
            log::debug!("removing replaced workflow {}", dir.display());
            self.parent_fs.delete_dir(&dir)?;
        }
        Ok(())
    }

    /// Discard pending changes, deleting anything written speculatively.
    ///
    /// Rejecting the creation of a workflow removes it entirely and
    /// restores whatever it replaced.
    pub fn reject(&mut self) -> Result<()> {
        self.backend.reject()?;
        if self.creating {
            log::debug!("removing partially created workflow {}", self.path.display());
            if self.path.exists() {
                self.parent_fs.delete_dir(&self.path)?;
            }
            restore_replaced(
                &self.parent_fs,
                &self.path,
                self.committed.replaced_dir.as_deref(),
            )?;
            self.creating = false;
        }
        self.staged = self.committed.clone();
        self.pending.clear();
        Ok(())
    }
}

// TEMPLATE ////////////////////
impl Store {
    /// Add a schema under its content key, unless already present.
    pub fn add_component_schema(&mut self, key: &str, schema: &TaskSchema) {
        let schemas = &mut self.staged.components.task_schemas;
        if !schemas.contains_key(key) {
            schemas.insert(key.to_owned(), schema.clone());
            self.pending.template_components.insert(key.to_owned());
        }
    }

    pub fn add_component_parameter(&mut self, name: &str) {
        if self.staged.components.parameters.insert(name.to_owned()) {
            self.pending.template_components.insert(name.to_owned());
        }
    }

    /// Set the workflow-wide resources element sets fall back on.
    pub fn set_template_resources(&mut self, resources: Vec<ResourceSpec>) {
        self.staged.template.resources = resources;
        self.pending.template_resources = true;
    }

    /// Insert a task at position `pos` and allocate its records.
    pub fn add_task(&mut self, pos: usize, task: StoredTask) {
        let insert_id = task.insert_id;
        self.staged.template.tasks.insert(pos, task);
        self.staged.tasks.insert(pos, TaskRecords::new(insert_id));
        self.staged.num_added_tasks += 1;
        self.pending.tasks.push(insert_id);
    }

    pub fn add_element_set(&mut self, task: InsertId, set: ElementSet) -> Result<usize> {
        let pos = self.staged.task_position(task)?;
        let sets = &mut self.staged.template.tasks[pos].element_sets;
        sets.push(set);
        *self.pending.element_sets.entry(task).or_default() += 1;
        Ok(sets.len() - 1)
    }

    pub fn add_loop(&mut self, lp: Loop) -> usize {
        self.staged.loops.push(lp);
        let idx = self.staged.loops.len() - 1;
        self.pending.loops.push(idx);
        idx
    }

    pub fn update_loop_num_added(&mut self, loop_idx: usize, num_added: u32) {
        if let Some(lp) = self.staged.loops.get_mut(loop_idx) {
            lp.num_added_iterations = num_added;
            self.pending.loop_iterations.insert(loop_idx);
        }
    }
}

// ELEMENTS ////////////////////
impl Store {
    pub fn add_element(&mut self, task: InsertId, element: Element) -> Result<ElementIdx> {
        let idx = self.staged.records_mut(task)?.elements.push(element);
        Pending::mark(&mut self.pending.elements, task, idx);
        Ok(idx)
    }

    /// Add an iteration and append it to its element's iteration list.
    pub fn add_iteration(&mut self, task: InsertId, iteration: Iteration) -> Result<IterIdx> {
        let records = self.staged.records_mut(task)?;
        let element_idx = iteration.element_idx;
        let idx = records.iterations.push(iteration);
        records
            .elements
            .try_get_mut(element_idx)
            .ok_or(Error::UnknownElement(task, element_idx))?
            .iterations
            .push(idx);
        Pending::mark(&mut self.pending.iterations, task, idx);
        Pending::mark(&mut self.pending.element_iter_ids, task, element_idx);
        Ok(idx)
    }

    pub fn update_loop_idx(
        &mut self,
        task: InsertId,
        iteration: IterIdx,
        loop_name: &str,
        idx: u32,
    ) -> Result<()> {
        self.iteration_mut(task, iteration)?
            .loop_idx
            .insert(loop_name.to_owned(), idx);
        Pending::mark(&mut self.pending.loop_idx, task, iteration);
        Ok(())
    }

    pub fn update_iteration_data_idx(
        &mut self,
        task: InsertId,
        iteration: IterIdx,
        key: &str,
        param: ParamRef,
    ) -> Result<()> {
        self.iteration_mut(task, iteration)?
            .data_idx
            .insert(key.to_owned(), param);
        Pending::mark(&mut self.pending.iterations, task, iteration);
        Ok(())
    }

    pub fn add_ear(&mut self, task: InsertId, run: Run) -> Result<EarIdx> {
        let idx = self.staged.records_mut(task)?.runs.push(run);
        Pending::mark(&mut self.pending.ears, task, idx);
        Ok(idx)
    }

    /// Record the EARs generated for an iteration and mark it initialised.
    pub fn set_iteration_ears(
        &mut self,
        task: InsertId,
        iteration: IterIdx,
        actions: BTreeMap<ActionIdx, Vec<EarIdx>>,
    ) -> Result<()> {
        let it = self.iteration_mut(task, iteration)?;
        it.actions = actions;
        it.ears_initialised = true;
        Pending::mark(&mut self.pending.iteration_ears, task, iteration);
        Ok(())
    }

    fn iteration_mut(&mut self, task: InsertId, iteration: IterIdx) -> Result<&mut Iteration> {
        Ok(self
            .staged
            .records_mut(task)?
            .iterations
            .try_get_mut(iteration)
            .ok_or(Error::UnknownIteration(task, iteration))?)
    }

    fn run_mut(&mut self, task: InsertId, ear: EarIdx) -> Result<&mut Run> {
        Ok(self
            .staged
            .records_mut(task)?
            .runs
            .try_get_mut(ear)
            .ok_or(Error::UnknownEar(task, ear))?)
    }
}

// PARAMETERS ////////////////////
impl Store {
    pub fn add_parameter(&mut self, data: ParamData, source: ParamSource) -> Result<ParamId> {
        let id = self.staged.parameters.next_id();
        if let Err(e) = self.backend.stage_parameter(id, &data) {
            // another process already took this index:
            if let Some(Error::ChunkExists(chunk)) = e.downcast_ref::<Error>() {
                log::warn!("parameter chunk {} was written by another process", chunk.display());
                return Err(Error::WorkflowBatchUpdateFailed(self.path.clone()).into());
            }
            return Err(e);
        }
        self.staged.parameters.push(data);
        self.staged.sources.push(source);
        self.pending.parameters.insert(id);
        Ok(id)
    }

    /// Give an unset parameter its value; parameters are write-once.
    pub fn set_parameter(&mut self, id: ParamId, value: Value) -> Result<()> {
        let data = self
            .staged
            .parameters
            .try_get_mut(id)
            .ok_or(Error::UnknownParameter(id))?;
        if data.is_set() {
            return Err(Error::ParameterAlreadySet(id).into());
        }
        *data = ParamData::Set(value);
        self.pending.parameter_sets.insert(id);
        Ok(())
    }

    pub fn patch_source(&mut self, id: ParamId, patch: &SourcePatch) -> Result<()> {
        self.staged
            .sources
            .try_get_mut(id)
            .ok_or(Error::UnknownParameter(id))?
            .apply(patch);
        self.pending.source_patches.insert(id);
        Ok(())
    }
}

// SUBMISSIONS ////////////////////
impl Store {
    pub fn add_submission(&mut self, submission: Submission) -> usize {
        self.staged.submissions.push(submission);
        let idx = self.staged.submissions.len() - 1;
        self.pending.submissions.push(idx);
        idx
    }

    pub fn set_ear_submission_idx(&mut self, task: InsertId, ear: EarIdx, sub: usize) -> Result<()> {
        self.run_mut(task, ear)?.submission_idx = Some(sub);
        Pending::mark(&mut self.pending.ear_submission_idx, task, ear);
        Ok(())
    }

    pub fn set_ear_start(&mut self, task: InsertId, ear: EarIdx, time: DateTime<Utc>) -> Result<()> {
        self.run_mut(task, ear)?.start_time = Some(time);
        Pending::mark(&mut self.pending.ear_times, task, ear);
        Ok(())
    }

    pub fn set_ear_end(&mut self, task: InsertId, ear: EarIdx, time: DateTime<Utc>) -> Result<()> {
        self.run_mut(task, ear)?.end_time = Some(time);
        Pending::mark(&mut self.pending.ear_times, task, ear);
        Ok(())
    }

    pub fn set_jobscript_dispatched(
        &mut self,
        sub: usize,
        js: usize,
        time: DateTime<Utc>,
        job_ref: Option<String>,
    ) -> Result<()> {
        let jobscript = self
            .staged
            .submissions
            .get_mut(sub)
            .ok_or(Error::UnknownSubmission(sub))?
            .jobscripts
            .get_mut(js)
            .ok_or(Error::UnknownJobscript(sub, js))?;
        jobscript.submit_time = Some(time);
        jobscript.scheduler_job_ref = job_ref;
        self.pending.submission_updates.insert(sub);
        Ok(())
    }

    pub fn set_submission_dispatched(&mut self, sub: usize, time: DateTime<Utc>) -> Result<()> {
        self.staged
            .submissions
            .get_mut(sub)
            .ok_or(Error::UnknownSubmission(sub))?
            .submit_time = Some(time);
        self.pending.submission_updates.insert(sub);
        Ok(())
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) => p.to_path_buf(),
        None => PathBuf::new(),
    }
}

/// `<path>.replaced-<timestamp>-<pid>`
fn replaced_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.file_name().unwrap_or(path.as_os_str()));
    name.push(format!(
        ".replaced-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S%f"),
        std::process::id()
    ));
    path.with_file_name(name)
}

fn restore_replaced(parent_fs: &Fs, path: &Path, replaced: Option<&Path>) -> Result<()> {
    if let Some(replaced) = replaced {
        if path.exists() {
            parent_fs.delete_dir(path)?;
        }
        log::info!("restoring {} from {}", path.display(), replaced.display());
        parent_fs.rename(replaced, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn opts(format: StoreFormat, overwrite: bool) -> CreateOptions {
        CreateOptions {
            format,
            chunk_size: 2,
            retry: RetryPolicy::none(),
            overwrite,
        }
    }

    fn add_param(store: &mut Store) -> Result<ParamId> {
        store.add_parameter(ParamData::Unset, ParamSource::workflow_resources())
    }

    #[test]
    fn parent_fs_is_rooted_next_to_the_workflow() -> Result<()> {
        assert_eq!(parent_dir(Path::new("wf")), PathBuf::new());

        let dir = tempdir()?;
        let path = dir.path().join("wf");
        let store = Store::create(&path, "w", &opts(StoreFormat::Json, false))?;
        assert_eq!(store.parent_fs.prefix(), dir.path());
        let reopened = Store::open(&path, &RetryPolicy::none())?;
        assert_eq!(reopened.parent_fs.prefix(), dir.path());
        Ok(())
    }

    #[test]
    fn rejected_changes_are_invisible() -> Result<()> {
        for format in [StoreFormat::Json, StoreFormat::Chunked] {
            let dir = tempdir()?;
            let path = dir.path().join("wf");
            let mut store = Store::create(&path, "w", &opts(format, false))?;
            store.commit()?;

            let id = add_param(&mut store)?;
            assert_eq!(store.doc().parameters.len(), 1);
            store.reject()?;
            assert!(store.doc().parameters.is_empty());
            assert!(store.doc().param(id).is_none());

            let reopened = Store::open(&path, &RetryPolicy::none())?;
            assert!(reopened.doc().parameters.is_empty());
        }
        Ok(())
    }

    #[test]
    fn committed_changes_persist() -> Result<()> {
        for format in [StoreFormat::Json, StoreFormat::Chunked] {
            let dir = tempdir()?;
            let path = dir.path().join("wf");
            let mut store = Store::create(&path, "w", &opts(format, false))?;
            let a = add_param(&mut store)?;
            let b = add_param(&mut store)?;
            store.set_parameter(b, json!([1, 2]))?;
            store.commit()?;
            store.set_parameter(a, json!("x"))?;
            store.commit()?;

            let reopened = Store::open(&path, &RetryPolicy::none())?;
            assert_eq!(reopened.format(), format);
            assert_eq!(reopened.doc(), store.doc());
            assert_eq!(
                reopened.doc().parameters.get(a),
                &ParamData::Set(json!("x"))
            );
        }
        Ok(())
    }

    #[test]
    fn parameters_are_write_once() -> Result<()> {
        let dir = tempdir()?;
        let mut store = Store::create(&dir.path().join("wf"), "w", &opts(StoreFormat::Json, false))?;
        let id = add_param(&mut store)?;
        store.set_parameter(id, json!(1))?;
        let err = store.set_parameter(id, json!(2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ParameterAlreadySet(_))
        ));
        let err = store.set_parameter(ParamId::new(9), json!(2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::UnknownParameter(_))
        ));
        Ok(())
    }

    #[test]
    fn concurrent_modification_fails_commit() -> Result<()> {
        for format in [StoreFormat::Json, StoreFormat::Chunked] {
            let dir = tempdir()?;
            let path = dir.path().join("wf");
            let mut store = Store::create(&path, "w", &opts(format, false))?;
            store.commit()?;

            let mut other = Store::open(&path, &RetryPolicy::none())?;
            let id = add_param(&mut other)?;
            other.set_parameter(id, json!(1))?;
            other.commit()?;

            store.add_submission(Submission {
                jobscripts: vec![],
                submit_time: None,
            });
            let err = store.commit().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::WorkflowBatchUpdateFailed(_))
            ));
            assert!(!store.has_pending());
            assert!(store.doc().submissions.is_empty());

            store.reload()?;
            assert_eq!(store.doc().parameters.len(), 1);
        }
        Ok(())
    }

    #[test]
    fn partial_flush_blocks_commits_until_reload() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        let mut store = Store::create(&path, "w", &opts(StoreFormat::Chunked, false))?;
        add_param(&mut store)?;
        store.commit()?;

        // the second sources chunk cannot be replaced, the first one can:
        let blocker = path.join("parameters/sources/1.json");
        std::fs::create_dir_all(&blocker)?;
        std::fs::write(blocker.join("x"), "")?;
        add_param(&mut store)?;
        add_param(&mut store)?;
        assert!(store.commit().is_err());
        assert!(!store.has_pending());
        assert_eq!(store.doc().parameters.len(), 1);
        std::fs::remove_dir_all(&blocker)?;

        add_param(&mut store)?;
        let err = store.commit().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::WorkflowBatchUpdateFailed(_))
        ));

        store.reload()?;
        assert_eq!(store.doc().parameters.len(), 1);
        add_param(&mut store)?;
        store.commit()?;
        let reopened = Store::open(&path, &RetryPolicy::none())?;
        assert_eq!(reopened.doc().parameters.len(), 2);
        Ok(())
    }

    #[test]
    fn overwrite_is_undone_by_reject() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        std::fs::create_dir(&path)?;
        std::fs::write(path.join("keep.txt"), "old")?;

        let err = Store::create(&path, "w", &opts(StoreFormat::Json, false));
        assert!(err.is_err());

        let mut store = Store::create(&path, "w", &opts(StoreFormat::Chunked, true))?;
        assert!(!path.join("keep.txt").exists());
        add_param(&mut store)?;
        store.reject()?;
        assert_eq!(std::fs::read_to_string(path.join("keep.txt"))?, "old");
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn overwrite_is_finalised_by_commit() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("wf");
        std::fs::create_dir(&path)?;
        std::fs::write(path.join("keep.txt"), "old")?;

        let mut store = Store::create(&path, "w", &opts(StoreFormat::Json, true))?;
        add_param(&mut store)?;
        store.commit()?;
        assert!(store.doc().replaced_dir.is_none());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);

        let reopened = Store::open(&path, &RetryPolicy::none())?;
        assert!(reopened.doc().replaced_dir.is_none());
        Ok(())
    }
}

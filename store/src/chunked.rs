use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use util::IdVec;
use workflow::{
    ActionIdx, DataIdx, EarIdx, Element, ElementIdx, InsertId, IterIdx, Iteration, Loop,
    ParamData, ParamId, ParamRef, ParamSource, Run, TaskRecords,
};

use crate::{
    fingerprint, Backend, Error, Fs, Pending, StoreFormat, TemplateComponents, TemplateDoc,
    WorkflowDoc,
};

const METADATA: &str = "metadata.json";
const SUBMISSIONS: &str = "submissions.json";
const PARAMETERS: &str = "parameters";
const PARAM_DATA: &str = "data";
const PARAM_SOURCES: &str = "sources";
const ATTRS: &str = "attrs.json";
const TASKS: &str = "tasks";
const ELEMENTS: &str = "elements";
const ITERATIONS: &str = "iterations";
const RUNS: &str = "runs";
const RUN_META: &str = "run_meta";

#[derive(Serialize, Deserialize)]
struct Metadata {
    template: TemplateDoc,
    components: TemplateComponents,
    num_added_tasks: u32,
    loops: Vec<Loop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replaced_dir: Option<PathBuf>,
    chunk_size: usize,
}

#[derive(Serialize, Deserialize, Default)]
struct ParamAttrs {
    num_parameters: usize,
}

/// Per-task side table. Data indices in iteration and run chunks refer to
/// their keys by position in `data_idx_keys`, which only ever grows.
#[derive(Serialize, Deserialize, Default)]
struct TaskAttrs {
    num_elements: usize,
    num_iterations: usize,
    num_runs: usize,
    data_idx_keys: Vec<String>,
}

type CompactIdx = Vec<(u32, ParamRef)>;

#[derive(Serialize, Deserialize)]
struct StoredIteration {
    element_idx: ElementIdx,
    data_idx: CompactIdx,
    loop_idx: BTreeMap<String, u32>,
    ears_initialised: bool,
    actions: BTreeMap<ActionIdx, Vec<EarIdx>>,
}

#[derive(Serialize, Deserialize)]
struct StoredRun {
    element_idx: ElementIdx,
    iteration_idx: IterIdx,
    action_idx: ActionIdx,
    run_idx: u32,
    data_idx: CompactIdx,
}

/// Mutable run state, kept one file per run so running jobs can
/// report progress without touching shared chunks.
#[derive(Serialize, Deserialize, Default, PartialEq)]
struct RunMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    submission_idx: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
}

/// Which items of one task to write.
#[derive(Default)]
struct TaskDirty {
    elements: BTreeSet<usize>,
    iterations: BTreeSet<usize>,
    runs: BTreeSet<usize>,
    run_meta: BTreeSet<usize>,
}

impl TaskDirty {
    fn all(records: &TaskRecords) -> Self {
        Self {
            elements: (0..records.elements.len()).collect(),
            iterations: (0..records.iterations.len()).collect(),
            runs: (0..records.runs.len()).collect(),
            run_meta: (0..records.runs.len()).collect(),
        }
    }

    fn from_pending(pending: &Pending, task: InsertId) -> Self {
        Self {
            elements: pending.dirty_elements(task).into_iter().map(usize::from).collect(),
            iterations: pending.dirty_iterations(task).into_iter().map(usize::from).collect(),
            runs: pending.dirty_runs(task).into_iter().map(usize::from).collect(),
            run_meta: pending.dirty_run_meta(task).into_iter().map(usize::from).collect(),
        }
    }
}

/// Stores each collection as a directory of fixed-size chunks,
/// and each parameter value as its own chunk.
pub struct ChunkedBackend {
    fs: Fs,
    chunk_size: usize,
    /// Parameter chunks written since the last commit.
    speculative: Vec<PathBuf>,
    key_tables: BTreeMap<InsertId, Vec<String>>,
}

impl ChunkedBackend {
    pub fn new(fs: Fs, chunk_size: usize) -> Self {
        Self {
            fs,
            chunk_size: chunk_size.max(1),
            speculative: Vec::with_capacity(0),
            key_tables: BTreeMap::new(),
        }
    }

    pub fn is_chunked_workflow(root: &Path) -> bool {
        root.join(METADATA).is_file()
    }

    fn root(&self) -> &Path {
        self.fs.prefix()
    }

    fn params_dir(&self) -> PathBuf {
        self.root().join(PARAMETERS)
    }

    fn param_data_path(&self, id: ParamId) -> PathBuf {
        self.params_dir().join(PARAM_DATA).join(format!("{id}.json"))
    }

    fn task_dir(&self, insert_id: InsertId) -> PathBuf {
        self.root().join(TASKS).join(format!("task_{insert_id}"))
    }
}

// WRITING ////////////////////
impl ChunkedBackend {
    fn write_metadata(&self, doc: &WorkflowDoc) -> Result<()> {
        let meta = Metadata {
            template: doc.template.clone(),
            components: doc.components.clone(),
            num_added_tasks: doc.num_added_tasks,
            loops: doc.loops.clone(),
            replaced_dir: doc.replaced_dir.clone(),
            chunk_size: self.chunk_size,
        };
        self.fs.write_json(self.root().join(METADATA), &meta)
    }

    fn write_task(&mut self, records: &TaskRecords, dirty: &TaskDirty) -> Result<()> {
        let dir = self.task_dir(records.insert_id);
        for sub in [ELEMENTS, ITERATIONS, RUNS, RUN_META] {
            self.fs.create_dir(dir.join(sub))?;
        }

        write_chunks(
            &self.fs,
            self.chunk_size,
            &dir.join(ELEMENTS),
            records.elements.as_slice(),
            &dirty.elements,
            |elem: &Element| elem.clone(),
        )?;

        let mut keys = self.key_tables.remove(&records.insert_id).unwrap_or_default();
        let res = self.write_indexed(records, dirty, &dir, &mut keys);
        self.key_tables.insert(records.insert_id, keys);
        res?;

        for &ear in &dirty.run_meta {
            let run = records.runs.get(EarIdx::from(ear));
            let meta = RunMeta {
                submission_idx: run.submission_idx,
                start_time: run.start_time,
                end_time: run.end_time,
            };
            if meta != RunMeta::default() {
                self.fs
                    .write_json(dir.join(RUN_META).join(format!("{ear}.json")), &meta)?;
            }
        }

        // counts last, so readers never see an item before its chunk exists:
        let attrs = TaskAttrs {
            num_elements: records.elements.len(),
            num_iterations: records.iterations.len(),
            num_runs: records.runs.len(),
            data_idx_keys: self
                .key_tables
                .get(&records.insert_id)
                .cloned()
                .unwrap_or_default(),
        };
        self.fs.write_json(dir.join(ATTRS), &attrs)
    }

    fn write_indexed(
        &self,
        records: &TaskRecords,
        dirty: &TaskDirty,
        dir: &Path,
        keys: &mut Vec<String>,
    ) -> Result<()> {
        write_chunks(
            &self.fs,
            self.chunk_size,
            &dir.join(ITERATIONS),
            records.iterations.as_slice(),
            &dirty.iterations,
            |it: &Iteration| StoredIteration {
                element_idx: it.element_idx,
                data_idx: encode(keys, &it.data_idx),
                loop_idx: it.loop_idx.clone(),
                ears_initialised: it.ears_initialised,
                actions: it.actions.clone(),
            },
        )?;
        write_chunks(
            &self.fs,
            self.chunk_size,
            &dir.join(RUNS),
            records.runs.as_slice(),
            &dirty.runs,
            |run: &Run| StoredRun {
                element_idx: run.element_idx,
                iteration_idx: run.iteration_idx,
                action_idx: run.action_idx,
                run_idx: run.run_idx,
                data_idx: encode(keys, &run.data_idx),
            },
        )
    }

    fn write_parameters(
        &self,
        doc: &WorkflowDoc,
        data: &BTreeSet<ParamId>,
        sources: &BTreeSet<ParamId>,
    ) -> Result<()> {
        let dir = self.params_dir();
        self.fs.create_dir(dir.join(PARAM_DATA))?;
        self.fs.create_dir(dir.join(PARAM_SOURCES))?;
        for &id in data {
            self.fs
                .write_json(self.param_data_path(id), doc.parameters.get(id))?;
        }
        let source_ids: BTreeSet<usize> = sources.iter().map(|&id| id.into()).collect();
        write_chunks(
            &self.fs,
            self.chunk_size,
            &dir.join(PARAM_SOURCES),
            doc.sources.as_slice(),
            &source_ids,
            |src: &ParamSource| src.clone(),
        )?;
        let attrs = ParamAttrs {
            num_parameters: doc.parameters.len(),
        };
        self.fs.write_json(dir.join(ATTRS), &attrs)
    }
}

// READING ////////////////////
impl ChunkedBackend {
    fn read_task(&mut self, insert_id: InsertId) -> Result<TaskRecords> {
        let dir = self.task_dir(insert_id);
        let attrs: TaskAttrs = self.fs.read_json(dir.join(ATTRS))?;
        let keys = &attrs.data_idx_keys;

        let elements: Vec<Element> =
            read_chunks(&self.fs, self.chunk_size, &dir.join(ELEMENTS), attrs.num_elements)?;

        let stored: Vec<StoredIteration> = read_chunks(
            &self.fs,
            self.chunk_size,
            &dir.join(ITERATIONS),
            attrs.num_iterations,
        )?;
        let mut iterations = IdVec::with_capacity(stored.len());
        for it in stored {
            iterations.push(Iteration {
                element_idx: it.element_idx,
                data_idx: decode(keys, it.data_idx, &dir)?,
                loop_idx: it.loop_idx,
                ears_initialised: it.ears_initialised,
                actions: it.actions,
            });
        }

        let stored: Vec<StoredRun> =
            read_chunks(&self.fs, self.chunk_size, &dir.join(RUNS), attrs.num_runs)?;
        let mut runs = IdVec::with_capacity(stored.len());
        for (i, run) in stored.into_iter().enumerate() {
            let meta_path = dir.join(RUN_META).join(format!("{i}.json"));
            let meta: RunMeta = if self.fs.exists(&meta_path) {
                self.fs.read_json(&meta_path)?
            } else {
                RunMeta::default()
            };
            runs.push(Run {
                element_idx: run.element_idx,
                iteration_idx: run.iteration_idx,
                action_idx: run.action_idx,
                run_idx: run.run_idx,
                data_idx: decode(keys, run.data_idx, &dir)?,
                submission_idx: meta.submission_idx,
                start_time: meta.start_time,
                end_time: meta.end_time,
            });
        }

        self.key_tables.insert(insert_id, attrs.data_idx_keys);
        Ok(TaskRecords {
            insert_id,
            elements: elements.into(),
            iterations,
            runs,
        })
    }
}

impl Backend for ChunkedBackend {
    fn format(&self) -> StoreFormat {
        StoreFormat::Chunked
    }

    fn initialise(&mut self, doc: &WorkflowDoc) -> Result<()> {
        self.fs.create_dir(self.root().join(TASKS))?;
        self.write_metadata(doc)?;
        for records in &doc.tasks {
            self.write_task(records, &TaskDirty::all(records))?;
        }
        let all: BTreeSet<ParamId> = (0..doc.parameters.len()).map(ParamId::from).collect();
        self.write_parameters(doc, &all, &all)?;
        self.fs.write_json(self.root().join(SUBMISSIONS), &doc.submissions)
    }

    fn load(&mut self) -> Result<WorkflowDoc> {
        let meta: Metadata = self.fs.read_json(self.root().join(METADATA))?;
        self.chunk_size = meta.chunk_size.max(1);

        let params: ParamAttrs = self.fs.read_json(self.params_dir().join(ATTRS))?;
        let mut parameters = IdVec::with_capacity(params.num_parameters);
        for i in 0..params.num_parameters {
            let data: ParamData = self.fs.read_json(self.param_data_path(ParamId::from(i)))?;
            parameters.push(data);
        }
        let sources: Vec<ParamSource> = read_chunks(
            &self.fs,
            self.chunk_size,
            &self.params_dir().join(PARAM_SOURCES),
            params.num_parameters,
        )?;

        self.key_tables.clear();
        let mut tasks = Vec::with_capacity(meta.template.tasks.len());
        for task in &meta.template.tasks {
            let records = self
                .read_task(task.insert_id)
                .with_context(|| format!("loading task {}", task.name))?;
            tasks.push(records);
        }

        Ok(WorkflowDoc {
            template: meta.template,
            components: meta.components,
            num_added_tasks: meta.num_added_tasks,
            tasks,
            loops: meta.loops,
            parameters,
            sources: sources.into(),
            submissions: self.fs.read_json(self.root().join(SUBMISSIONS))?,
            replaced_dir: meta.replaced_dir,
        })
    }

    fn fingerprint(&self) -> Result<String> {
        // run metadata and parameter values are left out: running jobs write those.
        let mut hasher = fingerprint::Hasher::default();
        for name in [METADATA, SUBMISSIONS] {
            hasher.add_file(&self.fs, &self.root().join(name))?;
        }
        hasher.add_file(&self.fs, &self.params_dir().join(ATTRS))?;
        for path in self.fs.list_dir(self.params_dir().join(PARAM_SOURCES))? {
            hasher.add_file(&self.fs, &path)?;
        }
        for task_dir in self.fs.list_dir(self.root().join(TASKS))? {
            hasher.add_file(&self.fs, &task_dir.join(ATTRS))?;
            for sub in [ELEMENTS, ITERATIONS, RUNS] {
                for path in self.fs.list_dir(task_dir.join(sub))? {
                    hasher.add_file(&self.fs, &path)?;
                }
            }
        }
        Ok(hasher.finish())
    }

    fn stage_parameter(&mut self, id: ParamId, data: &ParamData) -> Result<()> {
        let path = self.param_data_path(id);
        self.fs.create_dir(self.params_dir().join(PARAM_DATA))?;
        let bytes = serde_json::to_vec(data)?;
        self.fs.write_new(&path, &bytes)?;
        log::trace!("staged parameter chunk {}", path.display());
        self.speculative.push(path);
        Ok(())
    }

    /// Files are replaced one at a time, so an IO error part way through leaves
    /// the chunks already flushed on disk. The store's recorded fingerprint then
    /// no longer matches, and every later commit from that handle fails until
    /// the workflow is reloaded or reopened.
    fn commit(&mut self, doc: &WorkflowDoc, pending: &Pending) -> Result<()> {
        // template components, tasks, element sets and loops all live in the metadata doc:
        if pending.metadata_changed() {
            self.write_metadata(doc)?;
        }
        for insert_id in pending.dirty_tasks() {
            let records = doc.records(insert_id)?;
            self.write_task(records, &TaskDirty::from_pending(pending, insert_id))?;
        }
        if !pending.parameters.is_empty()
            || !pending.parameter_sets.is_empty()
            || !pending.source_patches.is_empty()
        {
            self.write_parameters(doc, &pending.parameter_sets, &pending.dirty_sources())?;
        }
        if pending.submissions_changed() {
            self.fs
                .write_json(self.root().join(SUBMISSIONS), &doc.submissions)?;
        }
        self.speculative.clear();
        Ok(())
    }

    fn reject(&mut self) -> Result<()> {
        for path in self.speculative.drain(..) {
            log::debug!("removing speculative chunk {}", path.display());
            self.fs.delete_file(&path)?;
        }
        Ok(())
    }
}

fn encode(keys: &mut Vec<String>, data_idx: &DataIdx) -> CompactIdx {
    data_idx
        .iter()
        .map(|(k, v)| {
            let pos = match keys.iter().position(|key| key == k) {
                Some(pos) => pos,
                None => {
                    keys.push(k.clone());
                    keys.len() - 1
                }
            };
            (pos as u32, v.clone())
        })
        .collect()
}

fn decode(keys: &[String], compact: CompactIdx, dir: &Path) -> Result<DataIdx> {
    compact
        .into_iter()
        .map(|(pos, v)| {
            let key = keys
                .get(pos as usize)
                .ok_or_else(|| Error::CorruptChunk(dir.to_path_buf()))?;
            Ok::<_, anyhow::Error>((key.clone(), v))
        })
        .collect()
}

fn chunk_path(dir: &Path, chunk: usize) -> PathBuf {
    dir.join(format!("{chunk}.json"))
}

/// Rewrite every chunk containing a dirty item.
fn write_chunks<T, S: Serialize>(
    fs: &Fs,
    chunk_size: usize,
    dir: &Path,
    items: &[T],
    dirty: &BTreeSet<usize>,
    mut convert: impl FnMut(&T) -> S,
) -> Result<()> {
    let chunks: BTreeSet<usize> = dirty.iter().map(|i| i / chunk_size).collect();
    if !chunks.is_empty() {
        fs.create_dir(dir)?;
    }
    for chunk in chunks {
        let start = chunk * chunk_size;
        let end = (start + chunk_size).min(items.len());
        if start >= end {
            continue;
        }
        let stored: Vec<S> = items[start..end].iter().map(&mut convert).collect();
        fs.write_json(chunk_path(dir, chunk), &stored)?;
    }
    Ok(())
}

fn read_chunks<S: DeserializeOwned>(
    fs: &Fs,
    chunk_size: usize,
    dir: &Path,
    len: usize,
) -> Result<Vec<S>> {
    let mut items = Vec::with_capacity(len);
    let num_chunks = len.div_ceil(chunk_size);
    for chunk in 0..num_chunks {
        let stored: Vec<S> = fs.read_json(chunk_path(dir, chunk))?;
        items.extend(stored);
    }
    if items.len() < len {
        return Err(Error::CorruptChunk(dir.to_path_buf()).into());
    }
    items.truncate(len);
    Ok(items)
}

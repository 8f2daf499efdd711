use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use workflow::{ParamData, ParamId};

use crate::{ChunkedBackend, Error, Fs, JsonBackend, Pending, WorkflowDoc};

/// Physical layout of a workflow directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    /// One JSON document, rewritten whole on every commit.
    #[default]
    Json,
    /// Chunked collections, written piecewise.
    Chunked,
}

impl FromStr for StoreFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "chunked" => Ok(Self::Chunked),
            _ => Err(Error::UnknownFormat(s.to_owned())),
        }
    }
}

impl fmt::Display for StoreFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Chunked => write!(f, "chunked"),
        }
    }
}

impl StoreFormat {
    /// Work out which format the workflow at `root` was written in.
    pub fn detect(root: &Path) -> Result<Self> {
        if JsonBackend::is_json_workflow(root) {
            Ok(Self::Json)
        } else if ChunkedBackend::is_chunked_workflow(root) {
            Ok(Self::Chunked)
        } else {
            Err(Error::NotAWorkflow(root.to_path_buf()).into())
        }
    }

    pub fn backend(&self, fs: Fs, chunk_size: usize) -> Box<dyn Backend> {
        match self {
            Self::Json => Box::new(JsonBackend::new(fs)),
            Self::Chunked => Box::new(ChunkedBackend::new(fs, chunk_size)),
        }
    }
}

/// A physical store for a [`WorkflowDoc`].
///
/// Backends never decide what changed; they are handed the staged document
/// together with the pending buckets describing what to write.
pub trait Backend {
    fn format(&self) -> StoreFormat;

    /// Write a complete document into a fresh directory.
    fn initialise(&mut self, doc: &WorkflowDoc) -> Result<()>;

    fn load(&mut self) -> Result<WorkflowDoc>;

    /// Summary of the on-disk state, compared at commit time to detect
    /// modification by other processes.
    fn fingerprint(&self) -> Result<String>;

    /// Called as each parameter is added, before commit.
    fn stage_parameter(&mut self, _id: ParamId, _data: &ParamData) -> Result<()> {
        Ok(())
    }

    /// Flush the pending changes, in dependency order.
    fn commit(&mut self, doc: &WorkflowDoc, pending: &Pending) -> Result<()>;

    /// Undo anything written by `stage_parameter` since the last commit.
    fn reject(&mut self) -> Result<()> {
        Ok(())
    }
}

//! Persistence for workflows.
//!
//! A [`Store`] holds the committed and staged versions of a [`WorkflowDoc`],
//! and writes staged changes through one of two backends: a single JSON
//! document, or a directory of chunked collections that can be updated
//! piecewise by many processes.

use std::path::PathBuf;

use workflow::{EarIdx, ElementIdx, InsertId, IterIdx, ParamId};

mod doc;
pub use doc::{StoredTask, TemplateComponents, TemplateDoc, WorkflowDoc};

mod pending;
pub use pending::Pending;

mod fs;
pub use fs::Fs;

mod fingerprint;

mod backend;
pub use backend::{Backend, StoreFormat};

mod json;
pub use json::JsonBackend;

mod chunked;
pub use chunked::ChunkedBackend;

mod store;
pub use store::{CreateOptions, Store};

/// Default number of items per chunk in the chunked format.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Workflow at {0:?} was modified by another process; batch update discarded")]
    WorkflowBatchUpdateFailed(PathBuf),
    #[error("A directory already exists at {0:?}")]
    WorkflowExists(PathBuf),
    #[error("No workflow found at {0:?}")]
    NotAWorkflow(PathBuf),
    #[error("Unknown store format \"{0}\"; expected \"json\" or \"chunked\"")]
    UnknownFormat(String),
    #[error("Parameter {0} already has a value")]
    ParameterAlreadySet(ParamId),
    #[error("No parameter with ID {0}")]
    UnknownParameter(ParamId),
    #[error("Task {0} has no element {1}")]
    UnknownElement(InsertId, ElementIdx),
    #[error("Task {0} has no iteration {1}")]
    UnknownIteration(InsertId, IterIdx),
    #[error("Task {0} has no EAR {1}")]
    UnknownEar(InsertId, EarIdx),
    #[error("No submission with index {0}")]
    UnknownSubmission(usize),
    #[error("Submission {0} has no jobscript {1}")]
    UnknownJobscript(usize, usize),
    #[error("Chunk {0:?} already exists")]
    ChunkExists(PathBuf),
    #[error("Chunk data under {0:?} is inconsistent with its attributes")]
    CorruptChunk(PathBuf),
    #[error("Path is not under the workflow directory: {0}")]
    NotWhitelisted(String),
}

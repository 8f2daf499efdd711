use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::{fingerprint, Backend, Fs, Pending, StoreFormat, WorkflowDoc};

const DOC_FILE: &str = "workflow.json";

/// Keeps the whole workflow in one document.
pub struct JsonBackend {
    fs: Fs,
    path: PathBuf,
}

impl JsonBackend {
    pub fn new(fs: Fs) -> Self {
        let path = fs.prefix().join(DOC_FILE);
        Self { fs, path }
    }

    pub fn is_json_workflow(root: &Path) -> bool {
        root.join(DOC_FILE).is_file()
    }
}

impl Backend for JsonBackend {
    fn format(&self) -> StoreFormat {
        StoreFormat::Json
    }

    fn initialise(&mut self, doc: &WorkflowDoc) -> Result<()> {
        self.fs.create_dir(self.fs.prefix())?;
        self.fs.write_json_pretty(&self.path, doc)
    }

    fn load(&mut self) -> Result<WorkflowDoc> {
        self.fs.read_json(&self.path)
    }

    fn fingerprint(&self) -> Result<String> {
        let mut hasher = fingerprint::Hasher::default();
        hasher.add_file(&self.fs, &self.path)?;
        Ok(hasher.finish())
    }

    fn commit(&mut self, doc: &WorkflowDoc, pending: &Pending) -> Result<()> {
        log::debug!(
            "writing {} ({} new parameters, {} new tasks)",
            self.path.display(),
            pending.parameters.len(),
            pending.tasks.len(),
        );
        self.fs.write_json_pretty(&self.path, doc)
    }
}

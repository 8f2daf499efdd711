use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::Fs;

/// Accumulates file contents into a single sha256 summary.
#[derive(Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Hash the file's name and contents; a missing file hashes as its name alone.
    pub fn add_file(&mut self, fs: &Fs, path: &Path) -> Result<()> {
        let name = path.strip_prefix(fs.prefix()).unwrap_or(path);
        self.inner.update(name.to_string_lossy().as_bytes());
        if fs.exists(path) {
            self.inner.update(fs.read(path)?);
        }
        self.inner.update([0u8]);
        Ok(())
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

use util::{PathEncodingError, RetryPolicy};

use crate::Error;

/// All file operations on a workflow directory go through this struct.
///
/// Destructive operations check that the path in question is a child of the
/// single whitelisted prefix, and every operation is retried with backoff
/// if it fails with a transient error.
#[derive(Debug, Clone)]
pub struct Fs {
    /// The directory we are allowed to modify
    prefix: PathBuf,
    retry: RetryPolicy,
}

impl Fs {
    /// Create a new `Fs` allowed to modify anything under `prefix`.
    pub fn new(prefix: &Path, retry: RetryPolicy) -> Self {
        Self {
            prefix: prefix.to_path_buf(),
            retry,
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Check if path exists on disk.
    pub fn exists<T: AsRef<Path>>(&self, path: T) -> bool {
        path.as_ref().exists()
    }

    /// Create a directory and any missing parents.
    pub fn create_dir<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        self.retry
            .run("creating dir", || fs::create_dir_all(path))
            .with_context(|| format!("creating dir {path:?}"))
    }

    /// Read an entire file.
    pub fn read<T: AsRef<Path>>(&self, path: T) -> Result<Vec<u8>> {
        let path = path.as_ref();
        self.retry
            .run("reading file", || fs::read(path))
            .with_context(|| format!("reading {path:?}"))
    }

    pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(&self, path: P) -> Result<T> {
        let path = path.as_ref();
        let bytes = self.read(path)?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {path:?}"))
    }

    /// Sorted paths of the entries in a directory; empty if it doesn't exist.
    pub fn list_dir<T: AsRef<Path>>(&self, path: T) -> Result<Vec<PathBuf>> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Ok(Vec::with_capacity(0));
        }
        let mut entries = self
            .retry
            .run("listing dir", || {
                fs::read_dir(path)?
                    .map(|entry| entry.map(|e| e.path()))
                    .collect::<io::Result<Vec<_>>>()
            })
            .with_context(|| format!("listing {path:?}"))?;
        // temp files from in-flight atomic writes:
        entries.retain(|p| {
            !p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        });
        entries.sort();
        Ok(entries)
    }

    /// Write `bytes` to a sibling temp file, sync it, then rename it over `path`,
    /// so readers only ever see the old or the new contents.
    pub fn write_atomic<T: AsRef<Path>>(&self, path: T, bytes: &[u8]) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        let tmp = tmp_path(path)?;
        self.retry
            .run("writing file", || {
                let mut f = fs::File::create(&tmp)?;
                f.write_all(bytes)?;
                f.sync_all()?;
                fs::rename(&tmp, path)
            })
            .with_context(|| format!("writing {path:?}"))
    }

    pub fn write_json<T: Serialize + ?Sized, P: AsRef<Path>>(&self, path: P, val: &T) -> Result<()> {
        let bytes = serde_json::to_vec(val)?;
        self.write_atomic(path, &bytes)
    }

    pub fn write_json_pretty<T: Serialize + ?Sized, P: AsRef<Path>>(
        &self,
        path: P,
        val: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(val)?;
        self.write_atomic(path, &bytes)
    }

    /// Write a file that must not exist yet.
    pub fn write_new<T: AsRef<Path>>(&self, path: T, bytes: &[u8]) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        let res = self.retry.run("writing new file", || {
            let mut f = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
            f.write_all(bytes)?;
            f.sync_all()
        });
        match res {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::ChunkExists(path.to_path_buf()).into())
            }
            other => other.with_context(|| format!("writing {path:?}")),
        }
    }

    /// Delete a file; missing files are not an error.
    pub fn delete_file<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        match self.retry.run("deleting file", || fs::remove_file(path)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.with_context(|| format!("deleting {path:?}")),
        }
    }

    /// Recursively delete a directory.
    pub fn delete_dir<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        self.retry
            .run("deleting dir", || fs::remove_dir_all(path))
            .with_context(|| format!("deleting dir {path:?}"))
    }

    /// Rename `src` to `tgt`; both must be whitelisted.
    pub fn rename<T: AsRef<Path>, U: AsRef<Path>>(&self, src: T, tgt: U) -> Result<()> {
        let (src, tgt) = (src.as_ref(), tgt.as_ref());
        self.check_whitelist(src)?;
        self.check_whitelist(tgt)?;
        self.retry
            .run("renaming", || fs::rename(src, tgt))
            .with_context(|| format!("renaming {src:?} to {tgt:?}"))
    }

    fn check_whitelist(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.prefix) {
            Ok(())
        } else {
            Err(Error::NotWhitelisted(path.to_str().ok_or(PathEncodingError)?.to_owned()).into())
        }
    }
}

fn tmp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(PathEncodingError)?;
    Ok(path.with_file_name(format!(".{name}.{}.tmp", std::process::id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_contents() -> Result<()> {
        let dir = tempdir()?;
        let fs = Fs::new(dir.path(), RetryPolicy::none());
        let path = dir.path().join("doc.json");
        fs.write_json(&path, &vec![1, 2])?;
        fs.write_json(&path, &vec![3])?;
        let back: Vec<u32> = fs.read_json(&path)?;
        assert_eq!(back, vec![3]);
        // no temp files left behind:
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn write_new_refuses_to_clobber() -> Result<()> {
        let dir = tempdir()?;
        let fs = Fs::new(dir.path(), RetryPolicy::none());
        let path = dir.path().join("0.json");
        fs.write_new(&path, b"1")?;
        let err = fs.write_new(&path, b"2").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ChunkExists(_))));
        assert_eq!(std::fs::read(&path)?, b"1");
        Ok(())
    }

    #[test]
    fn paths_outside_prefix_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let fs = Fs::new(&dir.path().join("wf"), RetryPolicy::none());
        let err = fs.write_atomic(dir.path().join("other.json"), b"{}").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotWhitelisted(_))));
        Ok(())
    }
}

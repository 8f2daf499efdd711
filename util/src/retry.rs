use std::io;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_DELAY_MS: u64 = 50;

/// Bounded exponential backoff for filesystem operations that can fail
/// transiently, e.g. while a file-sync client holds a lock on the workflow dir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after each further failure.
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
        }
    }

    /// Run `op`, retrying while it fails with a transient error and attempts remain.
    pub fn run<T>(&self, label: &str, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut delay = Duration::from_millis(self.initial_delay_ms);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(val) => return Ok(val),
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    log::warn!(
                        "{label} failed ({e}); retrying in {delay:?} (attempt {attempt} of {})",
                        self.max_attempts,
                    );
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// True for the error kinds we expect from locked or briefly unavailable files.
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

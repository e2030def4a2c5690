//! Durable job state: per-worker checkpoints, per-worker append-only result stores and the
//! permanent-failure log, each with a filesystem and an in-memory implementation.

pub mod checkpoint;
pub mod failures;
pub mod results;

pub use checkpoint::{Checkpoint, CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};
pub use failures::{FailedItem, FailureLog, FsFailureLog, MemoryFailureLog};
pub use results::{FsResultStore, MemoryResultStore, ResultStore};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CHECKPOINT_DIR: &str = "checkpoints";
const RESULTS_DIR: &str = "results";
const FAILURE_LOG_FILE: &str = "failures.jsonl";

/// The three stores a job persists into.
#[derive(Clone)]
pub struct JobStorage {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub results: Arc<dyn ResultStore>,
    pub failures: Arc<dyn FailureLog>,
    root: Option<PathBuf>,
}

impl JobStorage {
    /// Opens (creating if needed) the on-disk layout under `root`.
    pub fn filesystem(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let checkpoints = FsCheckpointStore::open(root.join(CHECKPOINT_DIR))?;
        let results = FsResultStore::open(root.join(RESULTS_DIR))?;
        let failures = FsFailureLog::open(root.join(FAILURE_LOG_FILE))?;

        tracing::info!(root = %root.display(), "opened filesystem job storage");

        Ok(Self {
            checkpoints: Arc::new(checkpoints),
            results: Arc::new(results),
            failures: Arc::new(failures),
            root: Some(root),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            checkpoints: Arc::new(MemoryCheckpointStore::default()),
            results: Arc::new(MemoryResultStore::default()),
            failures: Arc::new(MemoryFailureLog::default()),
            root: None,
        }
    }

    /// Root directory for filesystem storage; `None` when in memory.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

/// Runs blocking filesystem work off the async executor.
///
/// The closure runs to completion even if the awaiting task is cancelled, so a write is never
/// abandoned halfway.
pub(crate) async fn run_blocking<T, F>(operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .context("storage task panicked")?
}

/// Parses a JSON-Lines document.
///
/// A malformed final line without a trailing newline is a torn append and is skipped; any other
/// malformed line is an error.
pub(crate) fn parse_json_lines<T: DeserializeOwned>(contents: &str, label: &str) -> Result<Vec<T>> {
    let lines: Vec<&str> = contents.split('\n').collect();
    let last_index = lines.len().saturating_sub(1);
    let mut values = Vec::with_capacity(lines.len());

    for (index, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(value) => values.push(value),
            Err(err) if index == last_index => {
                tracing::warn!(
                    store = label,
                    line = index + 1,
                    error = %err,
                    "skipping torn final line"
                );
            }
            Err(err) => {
                bail!("{label} is corrupt at line {}: {err}", index + 1);
            }
        }
    }

    Ok(values)
}

use crate::collect::item::WorkItem;
use crate::store::results::append_line;
use crate::store::{parse_json_lines, run_blocking};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

/// An item that exhausted its processing attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: WorkItem,
    pub worker_id: usize,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedItem {
    pub fn new(item: WorkItem, worker_id: usize, error: &anyhow::Error) -> Self {
        Self {
            item,
            worker_id,
            error: format!("{error:#}"),
            failed_at: Utc::now(),
        }
    }
}

/// Append-only log of permanently failed items.
pub trait FailureLog: Send + Sync + 'static {
    fn append(&self, failed: FailedItem) -> BoxFuture<'_, Result<()>>;

    fn load(&self) -> BoxFuture<'_, Result<Vec<FailedItem>>>;
}

#[derive(Debug, Clone)]
pub struct FsFailureLog {
    path: PathBuf,
}

impl FsFailureLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }
}

impl FailureLog for FsFailureLog {
    fn append(&self, failed: FailedItem) -> BoxFuture<'_, Result<()>> {
        let path = self.path.clone();
        Box::pin(async move {
            let line = serde_json::to_vec(&failed).context("failed to serialize failed item")?;
            run_blocking(move || append_line(&path, line)).await
        })
    }

    fn load(&self) -> BoxFuture<'_, Result<Vec<FailedItem>>> {
        let path = self.path.clone();
        Box::pin(run_blocking(move || {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", path.display()))
                }
            };
            parse_json_lines(&contents, "failure log")
        }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryFailureLog {
    entries: Mutex<Vec<FailedItem>>,
}

impl FailureLog for MemoryFailureLog {
    fn append(&self, failed: FailedItem) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.entries
                .lock()
                .expect("failure log mutex poisoned")
                .push(failed);
            Ok(())
        })
    }

    fn load(&self) -> BoxFuture<'_, Result<Vec<FailedItem>>> {
        Box::pin(async move {
            Ok(self
                .entries
                .lock()
                .expect("failure log mutex poisoned")
                .clone())
        })
    }
}

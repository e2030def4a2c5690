use crate::collect::item::WorkItem;
use crate::store::run_blocking;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Durable record of the item a worker slot is holding.
///
/// Written before the worker touches the item and removed only after the item's result (or its
/// requeue) is durable, so it never lags behind the worker's in-memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub worker_id: usize,
    pub item: WorkItem,
    pub items_processed: u64,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(worker_id: usize, item: WorkItem, items_processed: u64) -> Self {
        Self {
            worker_id,
            item,
            items_processed,
            timestamp: Utc::now(),
        }
    }
}

/// One checkpoint slot per worker id. Only the owning worker (or the monitor, after detaching
/// that worker) writes a given slot.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>>;

    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Removes the slot's checkpoint. Clearing an empty slot is not an error.
    fn clear(&self, worker_id: usize) -> BoxFuture<'_, Result<()>>;

    /// Every stored checkpoint, ordered by worker id.
    fn list(&self) -> BoxFuture<'_, Result<Vec<Checkpoint>>>;
}

/// `worker_<id>.json` documents replaced atomically through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(dir: &Path, worker_id: usize) -> PathBuf {
        dir.join(format!("worker_{worker_id}.json"))
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))
}

fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let checkpoint = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;
    Ok(Some(checkpoint))
}

impl CheckpointStore for FsCheckpointStore {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        let path = Self::path_for(&self.dir, checkpoint.worker_id);
        Box::pin(async move {
            let bytes = serde_json::to_vec_pretty(&checkpoint)
                .context("failed to serialize checkpoint")?;
            run_blocking(move || write_atomic(&path, &bytes)).await
        })
    }

    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        let path = Self::path_for(&self.dir, worker_id);
        Box::pin(run_blocking(move || read_checkpoint(&path)))
    }

    fn clear(&self, worker_id: usize) -> BoxFuture<'_, Result<()>> {
        let path = Self::path_for(&self.dir, worker_id);
        Box::pin(run_blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }))
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        let dir = self.dir.clone();
        Box::pin(run_blocking(move || {
            let mut checkpoints = Vec::new();
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("failed to list {}", dir.display()))?;
            for entry in entries {
                let path = entry?.path();
                let is_checkpoint = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("worker_") && name.ends_with(".json"))
                    .unwrap_or(false);
                if !is_checkpoint {
                    continue;
                }
                if let Some(checkpoint) = read_checkpoint(&path)? {
                    checkpoints.push(checkpoint);
                }
            }
            checkpoints.sort_by_key(|checkpoint: &Checkpoint| checkpoint.worker_id);
            Ok(checkpoints)
        }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slots: Mutex<BTreeMap<usize, Checkpoint>>,
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.slots
                .lock()
                .expect("checkpoint mutex poisoned")
                .insert(checkpoint.worker_id, checkpoint);
            Ok(())
        })
    }

    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        Box::pin(async move {
            Ok(self
                .slots
                .lock()
                .expect("checkpoint mutex poisoned")
                .get(&worker_id)
                .cloned())
        })
    }

    fn clear(&self, worker_id: usize) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.slots
                .lock()
                .expect("checkpoint mutex poisoned")
                .remove(&worker_id);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Checkpoint>>> {
        Box::pin(async move {
            Ok(self
                .slots
                .lock()
                .expect("checkpoint mutex poisoned")
                .values()
                .cloned()
                .collect())
        })
    }
}

use crate::collect::item::CollectedRecord;
use crate::store::{parse_json_lines, run_blocking};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only per-worker result stores.
pub trait ResultStore: Send + Sync + 'static {
    fn append(&self, worker_id: usize, record: CollectedRecord) -> BoxFuture<'_, Result<()>>;

    /// Ids of every worker that has a store, ascending.
    fn workers(&self) -> BoxFuture<'_, Result<Vec<usize>>>;

    /// Records of one worker in append order.
    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Vec<CollectedRecord>>>;
}

/// `worker_<id>.jsonl` files, one record per line, synced after every append.
#[derive(Debug, Clone)]
pub struct FsResultStore {
    dir: PathBuf,
}

impl FsResultStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create results dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Path of the store owned by `worker_id`.
    pub fn path_for(&self, worker_id: usize) -> PathBuf {
        self.dir.join(format!("worker_{worker_id}.jsonl"))
    }
}

pub(crate) fn append_line(path: &Path, mut line: Vec<u8>) -> Result<()> {
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    drop_torn_tail(&mut file)
        .with_context(|| format!("failed to repair {}", path.display()))?;
    file.write_all(&line)
        .with_context(|| format!("failed to append to {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("failed to sync {}", path.display()))
}

const TAIL_SCAN_CHUNK: u64 = 4096;

/// Cuts an unterminated final line left by an interrupted append, so the next record starts on
/// a fresh line instead of being glued to the fragment.
fn drop_torn_tail(file: &mut File) -> io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut end = len;
    let mut keep = 0;
    let mut chunk = vec![0u8; TAIL_SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let window = &mut chunk[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(window)?;
        if let Some(pos) = window.iter().rposition(|byte| *byte == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    tracing::warn!(
        dropped_bytes = len - keep,
        "discarding torn final line left by an interrupted append"
    );
    file.set_len(keep)?;
    file.sync_data()
}

fn parse_worker_id(name: &str) -> Option<usize> {
    name.strip_prefix("worker_")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

impl ResultStore for FsResultStore {
    fn append(&self, worker_id: usize, record: CollectedRecord) -> BoxFuture<'_, Result<()>> {
        let path = self.path_for(worker_id);
        Box::pin(async move {
            let line = serde_json::to_vec(&record).context("failed to serialize record")?;
            run_blocking(move || append_line(&path, line)).await
        })
    }

    fn workers(&self) -> BoxFuture<'_, Result<Vec<usize>>> {
        let dir = self.dir.clone();
        Box::pin(run_blocking(move || {
            let mut workers = Vec::new();
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("failed to list {}", dir.display()))?;
            for entry in entries {
                let entry = entry?;
                if let Some(worker_id) = entry.file_name().to_str().and_then(parse_worker_id) {
                    workers.push(worker_id);
                }
            }
            workers.sort_unstable();
            Ok(workers)
        }))
    }

    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Vec<CollectedRecord>>> {
        let path = self.path_for(worker_id);
        Box::pin(run_blocking(move || {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", path.display()))
                }
            };
            parse_json_lines(&contents, &format!("result store {}", path.display()))
        }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    stores: Mutex<BTreeMap<usize, Vec<CollectedRecord>>>,
}

impl ResultStore for MemoryResultStore {
    fn append(&self, worker_id: usize, record: CollectedRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stores
                .lock()
                .expect("result store mutex poisoned")
                .entry(worker_id)
                .or_default()
                .push(record);
            Ok(())
        })
    }

    fn workers(&self) -> BoxFuture<'_, Result<Vec<usize>>> {
        Box::pin(async move {
            Ok(self
                .stores
                .lock()
                .expect("result store mutex poisoned")
                .keys()
                .copied()
                .collect())
        })
    }

    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Vec<CollectedRecord>>> {
        Box::pin(async move {
            Ok(self
                .stores
                .lock()
                .expect("result store mutex poisoned")
                .get(&worker_id)
                .cloned()
                .unwrap_or_default())
        })
    }
}

//! Merges the per-worker result stores into the final dataset.
//!
//! Records are ordered by `sequence_index` (ties broken by worker id, then store order) and
//! deduplicated by id keeping the first occurrence. A worker store that cannot be read is dropped
//! from the merge and reported; the remaining stores still contribute.

use crate::collect::item::CollectedRecord;
use crate::store::checkpoint::write_atomic;
use crate::store::{run_blocking, JobStorage};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// A worker store left out of the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedContribution {
    pub worker_id: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub total_collected: usize,
    /// Distinct ids in the failure log that never made it into the dataset.
    pub total_failed_permanently: usize,
    /// Records each worker contributed after deduplication.
    pub per_worker: BTreeMap<usize, usize>,
    pub dropped: Vec<DroppedContribution>,
}

/// Deduplicated records in `sequence_index` order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateDataset {
    records: Vec<CollectedRecord>,
}

impl AggregateDataset {
    pub fn records(&self) -> &[CollectedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<CollectedRecord> {
        self.records
    }

    /// Pretty JSON array. Identical inputs always produce identical bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.records).context("failed to serialize aggregate dataset")
    }

    /// Atomically replaces `path` with the serialized dataset.
    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let bytes = self.to_json_bytes()?;
        let target = path.clone();
        run_blocking(move || write_atomic(&target, &bytes)).await?;
        tracing::info!(
            path = %path.display(),
            records = self.records.len(),
            "aggregate dataset written"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub dataset: AggregateDataset,
    pub summary: AggregateSummary,
}

pub struct Aggregator {
    storage: JobStorage,
}

impl Aggregator {
    pub fn new(storage: JobStorage) -> Self {
        Self { storage }
    }

    pub async fn run(&self) -> Result<AggregateReport> {
        let workers = self
            .storage
            .results
            .workers()
            .await
            .context("failed to list worker result stores")?;

        let mut rows: Vec<(usize, CollectedRecord)> = Vec::new();
        let mut per_worker = BTreeMap::new();
        let mut dropped = Vec::new();

        for worker_id in workers {
            match self.storage.results.load(worker_id).await {
                Ok(records) => {
                    per_worker.insert(worker_id, 0);
                    rows.extend(records.into_iter().map(|record| (worker_id, record)));
                }
                Err(err) => {
                    tracing::warn!(
                        worker = worker_id,
                        error = %err,
                        "worker result store unreadable; dropping its contribution"
                    );
                    dropped.push(DroppedContribution {
                        worker_id,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        rows.sort_by(|(left_worker, left), (right_worker, right)| {
            left.sequence_index
                .cmp(&right.sequence_index)
                .then(left_worker.cmp(right_worker))
        });

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(rows.len());
        for (worker_id, record) in rows {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            *per_worker.entry(worker_id).or_insert(0) += 1;
            records.push(record);
        }

        let failures = self
            .storage
            .failures
            .load()
            .await
            .context("failed to read the permanent-failure log")?;
        let failed_ids: HashSet<&str> = failures
            .iter()
            .map(|failed| failed.item.id())
            .filter(|id| !seen.contains(*id))
            .collect();

        let summary = AggregateSummary {
            total_collected: records.len(),
            total_failed_permanently: failed_ids.len(),
            per_worker,
            dropped,
        };
        tracing::info!(
            total_collected = summary.total_collected,
            total_failed_permanently = summary.total_failed_permanently,
            dropped = summary.dropped.len(),
            "aggregate merged"
        );

        Ok(AggregateReport {
            dataset: AggregateDataset { records },
            summary,
        })
    }
}

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use backfill::{
    Boundary, ChildNode, ItemDetail, JobConfig, JobStatus, JobStorage, ListingEntry, ListingPage,
    ProgressEvent, RemoteSource, Runner, SourceError, WorkItem,
};
use futures::future::BoxFuture;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const DEFAULT_ITEM_COUNT: usize = 400;
const DEFAULT_PAGE_SIZE: usize = 25;
const DEFAULT_WORKER_COUNT: usize = 8;
const DEFAULT_LOG_DIRECTIVE: &str = "warn";
/// Newest simulated item: 2024-06-01T00:00:00Z, one item every ten minutes before it.
const NEWEST_POSITION: i64 = 1_717_200_000;
const POSITION_STEP: i64 = 600;

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    let args = ExampleArgs::from_env()?;
    let bar = build_progress_bar();
    bar.println(format!(
        "Backfilling {} simulated items with {} workers",
        args.item_count, args.worker_count
    ));

    let storage = match &args.output_dir {
        Some(dir) => JobStorage::filesystem(dir)?,
        None => JobStorage::in_memory(),
    };
    let config = JobConfig::builder()
        .worker_count(args.worker_count)
        .stall_timeout(Duration::from_secs(3))
        .request_timeout(Duration::from_secs(2))
        .monitor_interval(Duration::from_millis(250))
        .collector_request_interval(Duration::from_millis(20))
        .worker_request_interval(Duration::from_millis(5))
        .initial_backoff(Duration::from_millis(50))
        .max_backoff(Duration::from_millis(500))
        .build()?;

    let source = SimulatedSource::new(args.item_count, args.page_size);
    let mut runner = Runner::new(config, Arc::new(source), storage);
    let progress_handle = spawn_progress_renderer(runner.coordinator().subscribe(), bar.clone());

    let run_result = runner.run_until_ctrl_c(args.boundary).await;
    progress_handle.abort();

    let report = match run_result {
        Ok(report) => report,
        Err(err) => {
            bar.abandon_with_message("job failed to start");
            return Err(err);
        }
    };

    match &report.status {
        JobStatus::Completed => bar.finish_with_message("completed"),
        JobStatus::Stopped => bar.abandon_with_message("stopped by Ctrl-C"),
        JobStatus::Aborted { reason } => bar.abandon_with_message(format!("aborted: {reason}")),
    }

    let summary = &report.aggregate.summary;
    bar.println(format!(
        "Enqueued {} items: {} collected, {} failed permanently, {} worker stores dropped",
        report.total_enqueued,
        summary.total_collected,
        summary.total_failed_permanently,
        summary.dropped.len()
    ));

    if let Some(dir) = &args.output_dir {
        let path = std::path::Path::new(dir).join("dataset.json");
        report.aggregate.dataset.write_to(&path).await?;
        bar.println(format!("Dataset written to {}", path.display()));
    }

    Ok(())
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    backfill::init_tracing();
}

fn build_progress_bar() -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(1), ProgressDrawTarget::stdout_with_hz(12));
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} items ({per_sec:.2} items/s) {msg}",
    )
    .expect("valid progress bar template")
    .progress_chars("=>-");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn spawn_progress_renderer(
    mut events: broadcast::Receiver<ProgressEvent>,
    bar: ProgressBar,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProgressEvent::Snapshot(snapshot)) => {
                    bar.set_length(snapshot.total_enqueued.max(1));
                    bar.set_position(
                        snapshot.total_collected + snapshot.total_failed_permanently,
                    );
                    bar.set_message(format!(
                        "queue {} | working {} idle {} stalled {}",
                        snapshot.queue_depth,
                        snapshot.counts.working,
                        snapshot.counts.idle,
                        snapshot.counts.stalled
                    ));
                }
                Ok(ProgressEvent::WorkerRestarted {
                    worker_id,
                    requeued_item,
                }) => {
                    let item = requeued_item
                        .as_ref()
                        .map(|item| item.id().to_owned())
                        .unwrap_or_else(|| "<none>".to_owned());
                    bar.println(format!("worker {worker_id} restarted; requeued {item}"));
                }
                Ok(ProgressEvent::CollectionFinished { enqueued }) => {
                    bar.set_length(enqueued.max(1));
                    bar.println(format!("listing exhausted after {enqueued} items"));
                }
                Ok(ProgressEvent::Finished { .. }) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    })
}

struct ExampleArgs {
    item_count: usize,
    page_size: usize,
    worker_count: usize,
    boundary: Boundary,
    output_dir: Option<String>,
}

impl ExampleArgs {
    fn from_env() -> Result<Self> {
        let item_count = parse_env_with_default("BACKFILL_ITEMS", DEFAULT_ITEM_COUNT)?;
        let page_size = parse_env_with_default("BACKFILL_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        let worker_count = parse_env_with_default("BACKFILL_WORKERS", DEFAULT_WORKER_COUNT)?;
        let boundary = match env::var("BACKFILL_SINCE") {
            Ok(date) if !date.trim().is_empty() => Boundary::from_date(date.trim())?,
            _ => Boundary::unbounded(),
        };
        let output_dir = env::var("BACKFILL_OUTPUT_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty());

        ensure!(page_size > 0, "BACKFILL_PAGE_SIZE must be greater than 0");
        ensure!(worker_count > 0, "BACKFILL_WORKERS must be greater than 0");

        Ok(Self {
            item_count,
            page_size,
            worker_count,
            boundary,
            output_dir,
        })
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}

/// A listing with uneven detail latency, a few flaky items and one item that no longer exists.
struct SimulatedSource {
    item_count: usize,
    page_size: usize,
    flaked: Mutex<HashSet<usize>>,
}

impl SimulatedSource {
    fn new(item_count: usize, page_size: usize) -> Self {
        Self {
            item_count,
            page_size,
            flaked: Mutex::new(HashSet::new()),
        }
    }

    fn index_of(item: &WorkItem) -> usize {
        item.payload().parse().unwrap_or_default()
    }

    fn latency(index: usize) -> Duration {
        Duration::from_millis(10 + (index as u64 * 37) % 60)
    }
}

impl RemoteSource for SimulatedSource {
    fn fetch_listing_page<'a>(
        &'a self,
        cursor: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ListingPage>> {
        Box::pin(async move {
            let start = match cursor {
                None => 0,
                Some(cursor) => cursor
                    .parse::<usize>()
                    .map_err(|_| anyhow!(SourceError::Rejected {
                        reason: format!("bad cursor {cursor}"),
                    }))?,
            };
            let end = (start + self.page_size).min(self.item_count);
            let entries = (start..end)
                .map(|index| {
                    ListingEntry::new(
                        format!("post-{index:05}"),
                        NEWEST_POSITION - index as i64 * POSITION_STEP,
                        index.to_string(),
                    )
                })
                .collect();
            Ok(ListingPage {
                entries,
                next_cursor: (end < self.item_count).then(|| end.to_string()),
            })
        })
    }

    fn fetch_item_detail<'a>(&'a self, item: &'a WorkItem) -> BoxFuture<'a, Result<ItemDetail>> {
        Box::pin(async move {
            let index = Self::index_of(item);
            sleep(Self::latency(index)).await;

            if index == 7 {
                return Err(anyhow!(SourceError::Rejected {
                    reason: format!("{} was deleted", item.id()),
                }));
            }
            if index % 23 == 0 {
                let first_call = self
                    .flaked
                    .lock()
                    .expect("simulated source mutex poisoned")
                    .insert(index);
                if first_call {
                    return Err(anyhow!(SourceError::Unavailable {
                        reason: "simulated hiccup".into(),
                    }));
                }
            }

            let mut children = vec![ChildNode::loaded(
                format!("{}-c0", item.id()),
                json!({ "score": index % 10 }),
                vec![ChildNode::loaded(
                    format!("{}-c0-r0", item.id()),
                    json!({ "score": 1 }),
                    Vec::new(),
                )],
            )];
            if index % 5 == 0 {
                children.push(ChildNode::deferred(format!("{}-more", item.id())));
            }

            Ok(ItemDetail {
                fields: json!({ "title": format!("simulated post {index}"), "index": index }),
                children,
            })
        })
    }

    fn fetch_child_page<'a>(
        &'a self,
        _item: &'a WorkItem,
        cursor: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ChildNode>>> {
        Box::pin(async move {
            sleep(Duration::from_millis(5)).await;
            Ok(vec![ChildNode::loaded(
                format!("{cursor}-0"),
                json!({ "score": 0 }),
                Vec::new(),
            )])
        })
    }
}

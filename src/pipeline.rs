use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::fetcher::FetcherFactory;
use crate::input::{self, InputListing};
use crate::pool;
use crate::record::{Record, Status};
use crate::schema::FieldSchema;

#[derive(Debug, Clone, Serialize)]
pub struct FieldFill {
    pub field: String,
    pub present: usize,
}

/// Aggregate run statistics. Field names come from the schema; the
/// orchestrator knows nothing about strategy internals.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: usize,
    pub complete: usize,
    pub failed: usize,
    pub pending: usize,
    pub field_fill: Vec<FieldFill>,
}

impl Summary {
    pub fn compute(records: &[Record], field_names: &[String]) -> Self {
        let complete = records.iter().filter(|r| r.status == Status::Complete).count();
        let failed = records.iter().filter(|r| r.status == Status::Failed).count();
        let field_fill = field_names
            .iter()
            .map(|name| FieldFill {
                field: name.clone(),
                present: records.iter().filter(|r| r.field(name).is_present()).count(),
            })
            .collect();
        Summary {
            total: records.len(),
            complete,
            failed,
            pending: records.len() - complete - failed,
            field_fill,
        }
    }

    pub fn fill_rate(&self, fill: &FieldFill) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            fill.present as f64 / self.total as f64
        }
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    /// Every input record, in original input order.
    pub records: Vec<Record>,
    pub summary: Summary,
    /// True when the run was cancelled before the queue drained.
    pub interrupted: bool,
}

/// Top-level driver: ingest, resume from checkpoint, fan out over the
/// worker pool, stream completions into the checkpoint store, and
/// reassemble the final ordered record set.
pub async fn run(
    cfg: &PipelineConfig,
    schema: &FieldSchema,
    listings: Vec<InputListing>,
    make_fetcher: FetcherFactory,
    cancel: CancellationToken,
) -> anyhow::Result<PipelineReport> {
    cfg.validate()?;
    schema.validate()?;

    let records = input::ingest(listings)?;
    let total = records.len();

    let done: HashMap<String, Record> = if cfg.resume {
        CheckpointStore::load(&cfg.checkpoint_path)
            .context("loading checkpoint for resume")?
    } else {
        HashMap::new()
    };

    // Terminal snapshots from a previous run are taken as-is; everything
    // else is fetched this run.
    let mut finished = Vec::new();
    let mut pending = Vec::new();
    for record in records {
        match done.get(&record.id) {
            Some(snap) if snap.is_terminal() => {
                let mut snap = snap.clone();
                snap.origin_index = record.origin_index;
                finished.push(snap);
            }
            _ => pending.push(record),
        }
    }
    info!(
        total,
        resumed = finished.len(),
        pending = pending.len(),
        workers = cfg.worker_count,
        "starting enrichment"
    );

    let mut store = CheckpointStore::open(&cfg.checkpoint_path, cfg.checkpoint_flush_every);
    let mut completed: Vec<Record> = Vec::with_capacity(pending.len());
    let queue = pool::queue_of(pending);

    if !queue.lock().unwrap().is_empty() {
        let pb = ProgressBar::new(queue.lock().unwrap().len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );

        let (tx, mut rx) = mpsc::channel::<Record>(cfg.worker_count * 2);
        let handles = spawn_and_drop_tx(&queue, make_fetcher, schema, cfg, &cancel, tx);

        // Single consumer: the only writer the checkpoint store ever sees.
        while let Some(record) = rx.recv().await {
            store
                .append(&record)
                .await
                .context("checkpoint write failed")?;
            completed.push(record);
            pb.inc(1);
        }
        store.flush().await.context("final checkpoint flush failed")?;
        pb.finish_and_clear();

        for h in handles {
            let _ = h.await;
        }
    }

    let leftover = pool::drain(&queue);
    let interrupted = cancel.is_cancelled() || !leftover.is_empty();

    let mut records = finished;
    records.extend(completed);
    records.extend(leftover);
    records.sort_by_key(|r| r.origin_index);

    let summary = Summary::compute(&records, &schema.field_names());
    info!(
        complete = summary.complete,
        failed = summary.failed,
        pending = summary.pending,
        interrupted,
        "enrichment finished"
    );

    Ok(PipelineReport { records, summary, interrupted })
}

fn spawn_and_drop_tx(
    queue: &pool::PendingQueue,
    make_fetcher: FetcherFactory,
    schema: &FieldSchema,
    cfg: &PipelineConfig,
    cancel: &CancellationToken,
    tx: mpsc::Sender<Record>,
) -> Vec<tokio::task::JoinHandle<()>> {
    // All sender clones live in the workers; the stream closes when the
    // last worker exits.
    pool::spawn_workers(
        Arc::clone(queue),
        make_fetcher,
        Arc::new(schema.clone()),
        cfg,
        cancel.clone(),
        tx,
    )
}

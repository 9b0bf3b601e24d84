use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::FetchError;
use crate::extract::extract_record;
use crate::fetcher::{FetcherFactory, PageFetcher};
use crate::record::{Record, Status};
use crate::schema::FieldSchema;

/// Shared pending-work queue. Workers pop in input order; whatever is left
/// after a cancellation is still pending.
pub type PendingQueue = Arc<Mutex<VecDeque<Record>>>;

pub fn queue_of(records: Vec<Record>) -> PendingQueue {
    Arc::new(Mutex::new(records.into()))
}

pub fn drain(queue: &PendingQueue) -> Vec<Record> {
    queue.lock().unwrap().drain(..).collect()
}

/// Spawn `worker_count` long-lived workers over the queue. Each worker
/// builds its own fetcher session at start and holds it exclusively until
/// it exits; completions stream out over `tx` in completion order, which is
/// not input order. Dropping the last `tx` clone closes the stream.
pub fn spawn_workers(
    queue: PendingQueue,
    make_fetcher: FetcherFactory,
    schema: Arc<FieldSchema>,
    cfg: &PipelineConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<Record>,
) -> Vec<JoinHandle<()>> {
    (0..cfg.worker_count)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let make_fetcher = Arc::clone(&make_fetcher);
            let schema = Arc::clone(&schema);
            let cancel = cancel.clone();
            let tx = tx.clone();
            let timeout = cfg.per_record_timeout;
            tokio::spawn(async move {
                worker_loop(worker, queue, make_fetcher, schema, timeout, cancel, tx).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker: usize,
    queue: PendingQueue,
    make_fetcher: FetcherFactory,
    schema: Arc<FieldSchema>,
    timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<Record>,
) {
    let fetcher = match make_fetcher() {
        Ok(f) => f,
        Err(e) => {
            warn!(worker, "fetcher session setup failed: {}", e);
            return;
        }
    };

    loop {
        // Cooperative shutdown: stop picking up new records, finish the
        // current one.
        if cancel.is_cancelled() {
            debug!(worker, "stopping on cancellation");
            break;
        }
        let next = queue.lock().unwrap().pop_front();
        let Some(mut record) = next else { break };
        record.status = Status::InProgress;

        let record = process_one(fetcher.as_ref(), schema.as_ref(), timeout, record).await;
        if tx.send(record).await.is_err() {
            // Orchestrator is gone; no point continuing.
            break;
        }
    }
    // Session drops here on every exit path.
}

/// Fetch and extract one record. Failures land on the record, never on the
/// pool.
async fn process_one(
    fetcher: &dyn PageFetcher,
    schema: &FieldSchema,
    timeout: Duration,
    mut record: Record,
) -> Record {
    match tokio::time::timeout(timeout, fetcher.fetch(&record.source_url)).await {
        Ok(Ok(doc)) => {
            extract_record(&doc, schema, &mut record);
        }
        Ok(Err(e)) => {
            warn!(id = %record.id, url = %record.source_url, "fetch failed: {}", e);
            record.mark_failed(e.to_string());
        }
        Err(_) => {
            let e = FetchError::Timeout(timeout);
            warn!(id = %record.id, url = %record.source_url, "{}", e);
            record.mark_failed(e.to_string());
        }
    }
    record
}

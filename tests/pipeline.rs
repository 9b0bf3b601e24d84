use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use listing_enricher::config::PipelineConfig;
use listing_enricher::error::FetchError;
use listing_enricher::fetcher::{Document, FetcherFactory, PageFetcher};
use listing_enricher::input::InputListing;
use listing_enricher::pipeline;
use listing_enricher::record::{FieldValue, Record, Status};
use listing_enricher::schema::FieldSchema;

#[derive(Clone)]
enum StubPage {
    Html(String),
    /// Respond after a delay, to force completion order away from input order.
    Delayed(u64, String),
    Fail(String),
    /// Never respond within any reasonable per-record timeout.
    Hang,
}

struct StubFetcher {
    pages: Arc<HashMap<String, StubPage>>,
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Document, FetchError> {
        let page = self
            .pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| StubPage::Fail("unknown url".into()));
        match page {
            StubPage::Html(html) => Ok(Document::new(url.to_string(), 200, html)),
            StubPage::Delayed(ms, html) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Document::new(url.to_string(), 200, html))
            }
            StubPage::Fail(e) => Err(FetchError::Network(e)),
            StubPage::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("hang page answered")
            }
        }
    }
}

fn stub_factory(pages: HashMap<String, StubPage>) -> FetcherFactory {
    let pages = Arc::new(pages);
    Arc::new(move || {
        Ok(Box::new(StubFetcher { pages: Arc::clone(&pages) }) as Box<dyn PageFetcher>)
    })
}

fn listing(id: &str, url: &str) -> InputListing {
    InputListing {
        id: Some(id.to_string()),
        url: url.to_string(),
        title: None,
        price: None,
        location: None,
        image_url: None,
    }
}

fn config(checkpoint: PathBuf, workers: usize) -> PipelineConfig {
    PipelineConfig {
        worker_count: workers,
        per_record_timeout: Duration::from_millis(300),
        checkpoint_flush_every: 2,
        resume: true,
        checkpoint_path: checkpoint,
    }
}

fn titled(i: usize) -> String {
    format!("<h1><span>Item {i}</span></h1>")
}

fn title_of(r: &Record) -> Option<String> {
    r.field("title").as_str().map(str::to_string)
}

#[tokio::test]
async fn sample_scenario_preserves_order_and_isolates_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut pages = HashMap::new();
    pages.insert(
        "u1".to_string(),
        StubPage::Html(
            "<h1><span>Bike</span></h1>\
             <meta property=\"product:price:amount\" content=\"$50\">"
                .to_string(),
        ),
    );
    pages.insert("u2".to_string(), StubPage::Hang);

    let report = pipeline::run(
        &config(dir.path().join("cp.jsonl"), 2),
        &FieldSchema::default(),
        vec![listing("r1", "u1"), listing("r2", "u2")],
        stub_factory(pages),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.records.len(), 2);
    let r1 = &report.records[0];
    let r2 = &report.records[1];
    assert_eq!((r1.id.as_str(), r1.status), ("r1", Status::Complete));
    assert_eq!(title_of(r1).as_deref(), Some("Bike"));
    assert_eq!(r1.field("price").as_str(), Some("$50"));
    assert_eq!((r2.id.as_str(), r2.status), ("r2", Status::Failed));
    assert!(r2.error.as_deref().unwrap().contains("timeout"));
    assert!(!report.interrupted);
}

#[tokio::test]
async fn output_order_matches_input_despite_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let n = 8;
    let mut pages = HashMap::new();
    let mut listings = Vec::new();
    for i in 0..n {
        // Later inputs answer first
        pages.insert(
            format!("u{i}"),
            StubPage::Delayed(((n - i) as u64) * 25, titled(i)),
        );
        listings.push(listing(&format!("r{i}"), &format!("u{i}")));
    }

    let mut cfg = config(dir.path().join("cp.jsonl"), 4);
    cfg.per_record_timeout = Duration::from_secs(5);
    let report = pipeline::run(
        &cfg,
        &FieldSchema::default(),
        listings,
        stub_factory(pages),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let indices: Vec<usize> = report.records.iter().map(|r| r.origin_index).collect();
    assert_eq!(indices, (0..n).collect::<Vec<_>>());
    for (i, r) in report.records.iter().enumerate() {
        assert_eq!(r.id, format!("r{i}"));
        assert_eq!(title_of(r), Some(format!("Item {i}")));
    }
}

#[tokio::test]
async fn one_fetch_error_does_not_affect_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let mut pages = HashMap::new();
    let mut listings = Vec::new();
    for i in 0..5 {
        if i == 2 {
            pages.insert(format!("u{i}"), StubPage::Fail("connection reset".into()));
        } else {
            pages.insert(format!("u{i}"), StubPage::Html(titled(i)));
        }
        listings.push(listing(&format!("r{i}"), &format!("u{i}")));
    }

    let report = pipeline::run(
        &config(dir.path().join("cp.jsonl"), 3),
        &FieldSchema::default(),
        listings,
        stub_factory(pages),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.summary.complete, 4);
    assert_eq!(report.summary.failed, 1);
    let failed = &report.records[2];
    assert_eq!(failed.status, Status::Failed);
    assert!(failed.error.as_deref().unwrap().contains("connection reset"));
    for i in [0usize, 1, 3, 4] {
        assert_eq!(title_of(&report.records[i]), Some(format!("Item {i}")));
    }
}

#[tokio::test]
async fn fallback_strategy_rank_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut pages = HashMap::new();
    // No h1; the second title strategy has to match
    pages.insert(
        "u1".to_string(),
        StubPage::Html("<div role=\"heading\"><span>Fallback Title</span></div>".to_string()),
    );

    let report = pipeline::run(
        &config(dir.path().join("cp.jsonl"), 1),
        &FieldSchema::default(),
        vec![listing("r1", "u1")],
        stub_factory(pages),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    match report.records[0].field("title") {
        FieldValue::Present { value, rank } => {
            assert_eq!(value, &serde_json::json!("Fallback Title"));
            assert_eq!(*rank, 2);
        }
        FieldValue::Absent => panic!("expected title"),
    }
}

#[tokio::test]
async fn single_worker_equals_wide_pool() {
    let pages: HashMap<String, StubPage> = (0..6)
        .map(|i| {
            let page = if i == 4 {
                StubPage::Fail("gone".into())
            } else {
                StubPage::Html(titled(i))
            };
            (format!("u{i}"), page)
        })
        .collect();
    let listings: Vec<InputListing> = (0..6)
        .map(|i| listing(&format!("r{i}"), &format!("u{i}")))
        .collect();

    let mut outcomes = Vec::new();
    for workers in [1usize, 4] {
        let dir = tempfile::tempdir().unwrap();
        let report = pipeline::run(
            &config(dir.path().join("cp.jsonl"), workers),
            &FieldSchema::default(),
            listings.clone(),
            stub_factory(pages.clone()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        outcomes.push(
            report
                .records
                .iter()
                .map(|r| (r.id.clone(), r.status, title_of(r)))
                .collect::<Vec<_>>(),
        );
    }
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn resume_after_partial_checkpoint_matches_uninterrupted_run() {
    let n = 4usize;
    let listings: Vec<InputListing> = (0..n)
        .map(|i| listing(&format!("r{i}"), &format!("u{i}")))
        .collect();
    let full_pages: HashMap<String, StubPage> = (0..n)
        .map(|i| (format!("u{i}"), StubPage::Html(titled(i))))
        .collect();

    // Uninterrupted baseline
    let dir = tempfile::tempdir().unwrap();
    let baseline = pipeline::run(
        &config(dir.path().join("baseline.jsonl"), 2),
        &FieldSchema::default(),
        listings.clone(),
        stub_factory(full_pages.clone()),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let baseline: Vec<_> = baseline
        .records
        .iter()
        .map(|r| (r.id.clone(), r.status, title_of(r)))
        .collect();

    for k in [0usize, 1, n - 1, n] {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("cp.jsonl");
        let cfg = config(checkpoint.clone(), 2);

        // First run processes only the first K listings, then "stops".
        if k > 0 {
            pipeline::run(
                &cfg,
                &FieldSchema::default(),
                listings[..k].to_vec(),
                stub_factory(full_pages.clone()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        }

        // On resume, checkpointed pages are gone from the network; they must
        // come back from the checkpoint, not a re-fetch.
        let resume_pages: HashMap<String, StubPage> = (0..n)
            .map(|i| {
                let page = if i < k {
                    StubPage::Fail("must not be re-fetched".into())
                } else {
                    StubPage::Html(titled(i))
                };
                (format!("u{i}"), page)
            })
            .collect();

        let resumed = pipeline::run(
            &cfg,
            &FieldSchema::default(),
            listings.clone(),
            stub_factory(resume_pages),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let resumed: Vec<_> = resumed
            .records
            .iter()
            .map(|r| (r.id.clone(), r.status, title_of(r)))
            .collect();

        assert_eq!(resumed, baseline, "resume mismatch at K={k}");
    }
}

#[tokio::test]
async fn cancellation_returns_ordered_partial_result() {
    let dir = tempfile::tempdir().unwrap();
    let pages: HashMap<String, StubPage> = (0..3)
        .map(|i| (format!("u{i}"), StubPage::Html(titled(i))))
        .collect();
    let listings: Vec<InputListing> = (0..3)
        .map(|i| listing(&format!("r{i}"), &format!("u{i}")))
        .collect();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline::run(
        &config(dir.path().join("cp.jsonl"), 2),
        &FieldSchema::default(),
        listings,
        stub_factory(pages),
        cancel,
    )
    .await
    .unwrap();

    assert!(report.interrupted);
    assert_eq!(report.records.len(), 3);
    assert!(report.records.iter().all(|r| r.status == Status::Pending));
    let indices: Vec<usize> = report.records.iter().map(|r| r.origin_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
}

#[tokio::test]
async fn midrun_cancellation_finishes_in_flight_records() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("cp.jsonl");
    let pages: HashMap<String, StubPage> = (0..6)
        .map(|i| (format!("u{i}"), StubPage::Delayed(150, titled(i))))
        .collect();
    let listings: Vec<InputListing> = (0..6)
        .map(|i| listing(&format!("r{i}"), &format!("u{i}")))
        .collect();

    // Cancel while the first wave of fetches is still in flight.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = pipeline::run(
        &config(checkpoint.clone(), 2),
        &FieldSchema::default(),
        listings,
        stub_factory(pages),
        cancel,
    )
    .await
    .unwrap();

    assert!(report.interrupted);
    let complete: Vec<&Record> = report
        .records
        .iter()
        .filter(|r| r.status == Status::Complete)
        .collect();
    let pending = report
        .records
        .iter()
        .filter(|r| r.status == Status::Pending)
        .count();
    // One record per worker was in flight at cancellation; both finish,
    // the rest stay queued.
    assert_eq!(complete.len(), 2);
    assert_eq!(pending, 4);

    // In-flight completions must be durable, not just in memory.
    let done = listing_enricher::checkpoint::CheckpointStore::load(&checkpoint).unwrap();
    assert_eq!(done.len(), 2);
    for r in &complete {
        assert_eq!(done[&r.id].status, Status::Complete);
    }
}

#[tokio::test]
async fn final_flush_covers_the_unfinished_batch() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("cp.jsonl");
    let pages: HashMap<String, StubPage> = (0..3)
        .map(|i| (format!("u{i}"), StubPage::Html(titled(i))))
        .collect();
    let listings: Vec<InputListing> = (0..3)
        .map(|i| listing(&format!("r{i}"), &format!("u{i}")))
        .collect();

    // Batch size larger than the input: only the final flush writes.
    let mut cfg = config(checkpoint.clone(), 2);
    cfg.checkpoint_flush_every = 100;

    pipeline::run(
        &cfg,
        &FieldSchema::default(),
        listings,
        stub_factory(pages),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let done = listing_enricher::checkpoint::CheckpointStore::load(&checkpoint).unwrap();
    assert_eq!(done.len(), 3);
}

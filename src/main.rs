use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use listing_enricher::checkpoint::CheckpointStore;
use listing_enricher::config::{
    PipelineConfig, DEFAULT_CHECKPOINT, DEFAULT_FLUSH_EVERY, DEFAULT_TIMEOUT_SECS, DEFAULT_WORKERS,
};
use listing_enricher::enrich::{self, Enricher, HttpEnricher};
use listing_enricher::fetcher::HttpFetcher;
use listing_enricher::input;
use listing_enricher::pipeline::{self, Summary};
use listing_enricher::record::{Record, Status};
use listing_enricher::schema::FieldSchema;

#[derive(Parser)]
#[command(name = "listing_enricher", about = "Marketplace listing detail enricher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich listings by scraping each detail page
    Run {
        /// Input listings JSON (array of {id?, url, ...preview fields})
        #[arg(short, long)]
        input: PathBuf,
        /// Final ordered output JSON
        #[arg(short, long, default_value = "data/enriched.json")]
        output: PathBuf,
        /// Concurrent workers, each with its own fetch session
        #[arg(short = 'w', long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        /// Per-record fetch timeout in seconds
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout_secs: u64,
        /// Checkpoint after this many completions
        #[arg(long, default_value_t = DEFAULT_FLUSH_EVERY)]
        flush_every: usize,
        /// Ignore the existing checkpoint and re-fetch everything
        #[arg(long)]
        no_resume: bool,
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,
        /// Field schema JSON (defaults to the built-in marketplace schema)
        #[arg(long)]
        schema: Option<PathBuf>,
        /// Max listings to process
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Checkpoint statistics
    Stats {
        #[arg(long, default_value = DEFAULT_CHECKPOINT)]
        checkpoint: PathBuf,
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Request price estimates for completed records
    Estimate {
        /// Enriched records JSON (output of `run`)
        #[arg(short, long)]
        input: PathBuf,
        /// Estimation service endpoint
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value = "data/price_estimates.json")]
        out: PathBuf,
        /// Re-estimate records that already have an estimate
        #[arg(long)]
        force: bool,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            input,
            output,
            workers,
            timeout_secs,
            flush_every,
            no_resume,
            checkpoint,
            schema,
            limit,
        } => {
            let schema = load_schema(schema.as_deref())?;
            let mut listings = input::load_listings(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            if let Some(n) = limit {
                listings.truncate(n);
            }
            if listings.is_empty() {
                println!("No listings in input.");
                return Ok(());
            }

            let cfg = PipelineConfig {
                worker_count: workers,
                per_record_timeout: Duration::from_secs(timeout_secs),
                checkpoint_flush_every: flush_every,
                resume: !no_resume,
                checkpoint_path: checkpoint,
            };

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nInterrupting: letting in-flight records finish...");
                    ctrl_c.cancel();
                }
            });

            println!(
                "Enriching {} listings ({} workers)...",
                listings.len(),
                workers
            );
            let report = pipeline::run(
                &cfg,
                &schema,
                listings,
                HttpFetcher::factory(cfg.per_record_timeout),
                cancel,
            )
            .await?;

            write_records(&output, &report.records)?;
            print_summary(&report.summary);
            if report.interrupted {
                println!(
                    "Interrupted: {} records still pending; re-run to resume.",
                    report.summary.pending
                );
            }
            println!("Output written to {}", output.display());
            Ok(())
        }
        Commands::Stats { checkpoint, schema } => {
            let schema = load_schema(schema.as_deref())?;
            let done = CheckpointStore::load(&checkpoint)?;
            if done.is_empty() {
                println!("Checkpoint is empty. Run 'run' first.");
                return Ok(());
            }
            let mut records: Vec<Record> = done.into_values().collect();
            records.sort_by_key(|r| r.origin_index);
            print_summary(&Summary::compute(&records, &schema.field_names()));
            Ok(())
        }
        Commands::Estimate {
            input,
            endpoint,
            out,
            force,
            timeout_secs,
        } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let records: Vec<Record> = serde_json::from_str(&raw)?;
            let mut estimates = enrich::load_estimates(&out)?;

            let enricher = HttpEnricher::new(endpoint, Duration::from_secs(timeout_secs))?;
            let targets: Vec<&Record> = records
                .iter()
                .filter(|r| r.status == Status::Complete)
                .filter(|r| force || !estimates.contains_key(&r.id))
                .collect();
            println!("Estimating {} records...", targets.len());

            let mut ok = 0usize;
            let mut errors = 0usize;
            for record in targets {
                match enricher.enrich(record).await {
                    Ok(estimate) => {
                        estimates.insert(record.id.clone(), estimate);
                        ok += 1;
                    }
                    Err(e) => {
                        warn!(id = %record.id, "estimation failed: {}", e);
                        errors += 1;
                    }
                }
            }
            enrich::save_estimates(&out, &estimates)?;
            println!(
                "Done: {} estimated, {} errors. Saved to {}",
                ok,
                errors,
                out.display()
            );
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn load_schema(path: Option<&std::path::Path>) -> anyhow::Result<FieldSchema> {
    let schema = match path {
        Some(p) => FieldSchema::from_file(p).with_context(|| format!("reading {}", p.display()))?,
        None => FieldSchema::default(),
    };
    schema.validate()?;
    Ok(schema)
}

fn write_records(path: &std::path::Path, records: &[Record]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(records)?)?;
    Ok(())
}

fn print_summary(summary: &Summary) {
    println!(
        "Done: {} complete, {} failed, {} pending.",
        summary.complete, summary.failed, summary.pending
    );
    println!("Field fill rates:");
    for fill in &summary.field_fill {
        println!(
            "  {:<14} {:>4}/{:<4} ({:>5.1}%)",
            fill.field,
            fill.present,
            summary.total,
            summary.fill_rate(fill) * 100.0
        );
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use okazje_core::{Platform, RawDocument};
use okazje_scan::{
    analyze_document, Assess, CycleSummary, HttpAssess, Monitor, OfflineAssess, ScanConfig,
    ScanReport,
};
use okazje_storage::{
    Fetch, HttpClientConfig, HttpFetcher, KeywordStore, SeenSet, TokenBucketConfig,
};

#[derive(Debug, Parser)]
#[command(name = "okazje")]
#[command(about = "Secondhand-marketplace bargain scanner for collectibles")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the keyword monitor on a fixed interval until interrupted.
    Watch,
    /// Run a single scan cycle and print its summary.
    Scan,
    /// Evaluate a single listing URL, or a pasted text description.
    Analyze {
        /// Listing URL (olx/vinted/allegro/sprzedajemy/gratka) or free text.
        input: String,
    },
    /// Manage the monitored keyword list.
    Keywords {
        #[command(subcommand)]
        action: KeywordAction,
    },
}

#[derive(Debug, Subcommand)]
enum KeywordAction {
    List,
    Add { keyword: String },
    Remove { keyword: String },
}

fn init_logging() {
    // Default is info for our crates, quieter reqwest. RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn build_fetcher(config: &ScanConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        // One request every two seconds across all platforms; marketplaces
        // throttle anything faster.
        token_bucket: Some(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_secs(2),
        }),
        ..HttpClientConfig::default()
    })
}

fn build_assessor(config: &ScanConfig) -> Result<Arc<dyn Assess>> {
    match std::env::var("OKAZJE_ASSESS_URL") {
        Ok(endpoint) => {
            let timeout = Duration::from_secs(config.http_timeout_secs);
            Ok(Arc::new(HttpAssess::new(endpoint, timeout)?))
        }
        Err(_) => {
            warn!("OKAZJE_ASSESS_URL not set, listings will be flagged for manual review");
            Ok(Arc::new(OfflineAssess))
        }
    }
}

fn print_report(report: &ScanReport) {
    let listing = &report.listing;
    let result = &report.result;
    println!(
        "{} {:?} | {} | {:.2} {} | margin {:.0}%",
        result.verdict.emoji(),
        result.verdict,
        listing.title,
        listing.price,
        listing.currency,
        result.margin_percent,
    );
    for reason in &result.reasons {
        println!("   - {reason}");
    }
    if let Some(url) = &listing.url {
        println!("   {url}");
    }
}

fn print_summary(summary: &CycleSummary) {
    println!(
        "cycle {} done: keywords={} fetched={} parsed={} dupes={} evaluated={} reported={}",
        summary.run_id,
        summary.keywords,
        summary.fetched,
        summary.parsed,
        summary.duplicates,
        summary.evaluated,
        summary.reported,
    );
    if summary.normalization_failures > 0 {
        println!("  skipped {} malformed listings", summary.normalization_failures);
    }
    for err in &summary.errors {
        println!("  error: {err}");
    }
}

async fn run_watch(config: ScanConfig) -> Result<()> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let seen = Arc::new(SeenSet::open(config.seen_path()).await?);
    let keywords = Arc::new(KeywordStore::open(config.keywords_path()).await?);
    let fetcher: Arc<dyn Fetch> = Arc::new(build_fetcher(&config)?);
    let assessor = build_assessor(&config)?;

    let (report_tx, mut report_rx) = mpsc::channel::<ScanReport>(64);
    let printer = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            print_report(&report);
        }
    });

    let monitor = Arc::new(Monitor::new(
        &config, fetcher, assessor, seen, keywords, report_tx,
    ));

    info!(
        interval_minutes = config.scan_interval_minutes,
        max_price = config.max_price,
        min_margin = config.min_margin_percent,
        "monitor starting"
    );

    // First cycle runs immediately; the interval loop takes over after.
    if let Some(summary) = monitor.try_scan().await? {
        print_summary(&summary);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = config.scan_interval();
    let runner = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run_forever(interval, shutdown_rx).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("listening for interrupt")?;
    info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(true);
    // An in-flight cycle finishes its current unit before the loop exits.
    runner.await.ok();

    drop(monitor);
    printer.await.ok();
    Ok(())
}

async fn run_scan(config: ScanConfig) -> Result<()> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let seen = Arc::new(SeenSet::open(config.seen_path()).await?);
    let keywords = Arc::new(KeywordStore::open(config.keywords_path()).await?);
    let fetcher: Arc<dyn Fetch> = Arc::new(build_fetcher(&config)?);
    let assessor = build_assessor(&config)?;

    let (report_tx, mut report_rx) = mpsc::channel::<ScanReport>(64);
    let monitor = Monitor::new(&config, fetcher, assessor, seen, keywords, report_tx);

    // Drain while the cycle runs: a cycle can produce more reports than the
    // channel holds, and a full channel would wedge the scan.
    let printer = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            print_report(&report);
        }
    });

    let summary = monitor
        .try_scan()
        .await?
        .context("scan trigger coalesced; no other cycle should be running")?;
    drop(monitor);
    printer.await.ok();
    print_summary(&summary);
    Ok(())
}

async fn run_analyze(config: ScanConfig, input: String) -> Result<()> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let seen = SeenSet::open(config.seen_path()).await?;
    let assessor = build_assessor(&config)?;

    let doc = if input.starts_with("http://") || input.starts_with("https://") {
        let platform = Platform::from_url(&input)
            .with_context(|| format!("unsupported marketplace url: {input}"))?;
        let fetcher = build_fetcher(&config)?;
        fetcher.fetch(&input, platform).await?
    } else {
        RawDocument {
            body: input,
            url: None,
            platform: Platform::Manual,
            fetched_at: Utc::now(),
        }
    };

    let report = analyze_document(&doc, assessor.as_ref(), &config.policy(), &seen).await?;
    print_report(&report);
    Ok(())
}

async fn run_keywords(config: ScanConfig, action: KeywordAction) -> Result<()> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let store = KeywordStore::open(config.keywords_path()).await?;
    match action {
        KeywordAction::List => {
            for keyword in store.list().await {
                println!("{keyword}");
            }
        }
        KeywordAction::Add { keyword } => {
            store.add(&keyword).await?;
            println!("added \"{keyword}\"");
        }
        KeywordAction::Remove { keyword } => {
            store.remove(&keyword).await?;
            println!("removed \"{keyword}\"");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = ScanConfig::from_env();

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => run_watch(config).await,
        Commands::Scan => run_scan(config).await,
        Commands::Analyze { input } => run_analyze(config, input).await,
        Commands::Keywords { action } => run_keywords(config, action).await,
    }
}

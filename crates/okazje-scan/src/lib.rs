//! Keyword monitor: periodic, coalesced scan cycles over marketplace search
//! endpoints, feeding Adapter -> Normalizer -> Engine -> Seen-Set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use okazje_core::{
    evaluate, normalize, Assessment, CanonicalListing, EnginePolicy, Platform, RawDocument,
    Verdict, VerdictResult,
};
use okazje_storage::{Fetch, KeywordStore, SeenSet};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "okazje-scan";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_price must be positive, got {0}")]
    MaxPrice(f64),
    #[error("min_margin_percent must be positive, got {0}")]
    MinMargin(f64),
    #[error("scan_interval_minutes must be positive")]
    ScanInterval,
    #[error("seen_retention_days must be positive, got {0}")]
    SeenRetention(i64),
}

/// Scan configuration; invalid numeric policy is fatal at startup, never
/// silently clamped.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_price: f64,
    pub min_margin_percent: f64,
    pub scan_interval_minutes: u64,
    pub parallelism: usize,
    pub seen_retention_days: i64,
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_price: 550.0,
            min_margin_percent: 200.0,
            scan_interval_minutes: 30,
            parallelism: 4,
            seen_retention_days: 90,
            data_dir: PathBuf::from("./data"),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            http_timeout_secs: 15,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl ScanConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_price: env_parse("MAX_PRICE").unwrap_or(defaults.max_price),
            min_margin_percent: env_parse("MIN_MARGIN").unwrap_or(defaults.min_margin_percent),
            scan_interval_minutes: env_parse("SCAN_INTERVAL")
                .unwrap_or(defaults.scan_interval_minutes),
            parallelism: env_parse("OKAZJE_PARALLELISM").unwrap_or(defaults.parallelism),
            seen_retention_days: env_parse("OKAZJE_SEEN_RETENTION_DAYS")
                .unwrap_or(defaults.seen_retention_days),
            data_dir: std::env::var("OKAZJE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user_agent: std::env::var("OKAZJE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("OKAZJE_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_price <= 0.0 {
            return Err(ConfigError::MaxPrice(self.max_price));
        }
        if self.min_margin_percent <= 0.0 {
            return Err(ConfigError::MinMargin(self.min_margin_percent));
        }
        if self.scan_interval_minutes == 0 {
            return Err(ConfigError::ScanInterval);
        }
        // A non-positive window would evict everything each cycle and
        // re-report old listings.
        if self.seen_retention_days <= 0 {
            return Err(ConfigError::SeenRetention(self.seen_retention_days));
        }
        Ok(())
    }

    pub fn policy(&self) -> EnginePolicy {
        EnginePolicy {
            max_price: self.max_price,
            min_margin_percent: self.min_margin_percent,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_minutes * 60)
    }

    pub fn seen_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.seen_retention_days)
    }

    pub fn seen_path(&self) -> PathBuf {
        self.data_dir.join("seen.json")
    }

    pub fn keywords_path(&self) -> PathBuf {
        self.data_dir.join("keywords.json")
    }
}

#[derive(Debug, Error)]
pub enum AssessmentError {
    #[error("assessment provider rate limited")]
    RateLimited,
    #[error("malformed assessment response: {0}")]
    MalformedResponse(String),
    #[error("assessment provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Valuation provider seam; mocked in tests with deterministic stubs.
#[async_trait]
pub trait Assess: Send + Sync {
    async fn assess(&self, listing: &CanonicalListing) -> Result<Assessment, AssessmentError>;
}

/// Assessment provider backed by an HTTP valuation endpoint: the listing is
/// POSTed as JSON and the response carries the authenticity label, market
/// value estimate, confidence and rationale.
pub struct HttpAssess {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAssess {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building assessment client: {e}"))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Assess for HttpAssess {
    async fn assess(&self, listing: &CanonicalListing) -> Result<Assessment, AssessmentError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(listing)
            .send()
            .await
            .map_err(|e| AssessmentError::ProviderUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AssessmentError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(AssessmentError::ProviderUnavailable(format!(
                "http status {}",
                response.status().as_u16()
            )));
        }

        let assessment: Assessment = response
            .json()
            .await
            .map_err(|e| AssessmentError::MalformedResponse(e.to_string()))?;
        if !(0.0..=1.0).contains(&assessment.confidence) || assessment.estimated_market_value < 0.0
        {
            return Err(AssessmentError::MalformedResponse(format!(
                "confidence {} / market value {} out of range",
                assessment.confidence, assessment.estimated_market_value
            )));
        }
        Ok(assessment)
    }
}

/// Stand-in provider when no valuation endpoint is configured; every listing
/// degrades to Investigate through the usual "valuation unavailable" path.
pub struct OfflineAssess;

#[async_trait]
impl Assess for OfflineAssess {
    async fn assess(&self, _listing: &CanonicalListing) -> Result<Assessment, AssessmentError> {
        Err(AssessmentError::ProviderUnavailable(
            "no valuation endpoint configured".to_string(),
        ))
    }
}

/// One qualifying listing handed to the notification consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub listing: CanonicalListing,
    pub result: VerdictResult,
}

/// End-of-cycle accounting, emitted regardless of partial failures.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keywords: usize,
    pub fetched: usize,
    pub parsed: usize,
    pub normalization_failures: usize,
    pub duplicates: usize,
    pub evaluated: usize,
    pub reported: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
struct UnitCounts {
    fetched: usize,
    parsed: usize,
    normalization_failures: usize,
    duplicates: usize,
    evaluated: usize,
    reported: usize,
    error: Option<String>,
}

/// Run the verdict engine against an external assessment, degrading to
/// Investigate when the valuation provider fails: the listing is surfaced,
/// never silently dropped.
pub async fn assess_and_evaluate(
    listing: &CanonicalListing,
    assessor: &dyn Assess,
    policy: &EnginePolicy,
) -> VerdictResult {
    match assessor.assess(listing).await {
        Ok(assessment) => match evaluate(listing, &assessment, policy) {
            Ok(result) => result,
            Err(err) => {
                // normalize() guarantees a positive price, so this branch is
                // defensive only.
                warn!(listing_id = %listing.id, error = %err, "listing failed revalidation");
                VerdictResult {
                    verdict: Verdict::Skip,
                    margin_percent: 0.0,
                    reasons: vec!["invalid listing".to_string()],
                }
            }
        },
        Err(err) => {
            warn!(listing_id = %listing.id, error = %err, "assessment failed");
            VerdictResult {
                verdict: Verdict::Investigate,
                margin_percent: 0.0,
                reasons: vec!["valuation unavailable".to_string()],
            }
        }
    }
}

/// One-shot path for the chat-interface consumer: parse, normalize, value,
/// record seen, report.
pub async fn analyze_document(
    doc: &RawDocument,
    assessor: &dyn Assess,
    policy: &EnginePolicy,
    seen: &SeenSet,
) -> anyhow::Result<ScanReport> {
    let adapter = okazje_adapters::adapter_for(doc.platform);
    let partial = adapter.parse(doc)?;
    let listing = normalize(doc.platform, doc.url.as_deref(), &partial, doc.fetched_at)?;
    let result = assess_and_evaluate(&listing, assessor, policy).await;
    seen.mark_seen(&listing.id, Utc::now()).await?;
    Ok(ScanReport { listing, result })
}

/// Keyword monitor. Owns the scan state and enforces "one cycle at a time":
/// re-entrant triggers while a cycle is in flight coalesce into a no-op.
pub struct Monitor {
    policy: EnginePolicy,
    parallelism: usize,
    seen_retention: chrono::Duration,
    fetcher: Arc<dyn Fetch>,
    assessor: Arc<dyn Assess>,
    seen: Arc<SeenSet>,
    keywords: Arc<KeywordStore>,
    reports: mpsc::Sender<ScanReport>,
    cycle_lock: Mutex<()>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ScanConfig,
        fetcher: Arc<dyn Fetch>,
        assessor: Arc<dyn Assess>,
        seen: Arc<SeenSet>,
        keywords: Arc<KeywordStore>,
        reports: mpsc::Sender<ScanReport>,
    ) -> Self {
        Self {
            policy: config.policy(),
            parallelism: config.parallelism.max(1),
            seen_retention: config.seen_retention(),
            fetcher,
            assessor,
            seen,
            keywords,
            reports,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Trigger a scan cycle. Returns `None` when another cycle is already in
    /// flight (the trigger is coalesced, not queued).
    pub async fn try_scan(&self) -> anyhow::Result<Option<CycleSummary>> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            info!("scan already in flight, trigger coalesced");
            return Ok(None);
        };
        let summary = self.run_cycle(None).await?;
        Ok(Some(summary))
    }

    /// Fixed-interval loop plus clean shutdown. An in-flight cycle finishes
    /// its current keyword/platform unit instead of being interrupted
    /// mid-normalization; new units stop being scheduled once shutdown fires.
    pub async fn run_forever(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick is skipped so startup does not scan twice
        // when the CLI already ran a manual cycle.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Ok(_guard) = self.cycle_lock.try_lock() else {
                        info!("previous scan still running, tick coalesced");
                        continue;
                    };
                    match self.run_cycle(Some(shutdown.clone())).await {
                        Ok(summary) => log_summary(&summary),
                        Err(err) => warn!(error = %err, "scan cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, monitor stopping");
                    return;
                }
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn run_cycle(
        &self,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> anyhow::Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let evicted = self.seen.evict_older_than(self.seen_retention, started_at).await?;
        if evicted > 0 {
            debug!(%run_id, evicted, "expired seen-set entries evicted");
        }

        let keywords = self.keywords.list().await;
        let mut units = Vec::new();
        for keyword in &keywords {
            for platform in okazje_adapters::monitored_platforms() {
                units.push((keyword.clone(), *platform));
            }
        }

        let unit_counts: Vec<UnitCounts> = stream::iter(units)
            .map(|(keyword, platform)| {
                let shutdown = shutdown.clone();
                async move {
                    if shutdown.as_ref().is_some_and(|s| *s.borrow()) {
                        return UnitCounts::default();
                    }
                    self.scan_unit(run_id, &keyword, platform).await
                }
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            keywords: keywords.len(),
            fetched: 0,
            parsed: 0,
            normalization_failures: 0,
            duplicates: 0,
            evaluated: 0,
            reported: 0,
            errors: Vec::new(),
        };
        for counts in unit_counts {
            summary.fetched += counts.fetched;
            summary.parsed += counts.parsed;
            summary.normalization_failures += counts.normalization_failures;
            summary.duplicates += counts.duplicates;
            summary.evaluated += counts.evaluated;
            summary.reported += counts.reported;
            if let Some(error) = counts.error {
                summary.errors.push(error);
            }
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// One keyword on one platform. Failures here stay local: they land in
    /// the cycle summary and never abort the remaining units.
    async fn scan_unit(&self, run_id: Uuid, keyword: &str, platform: Platform) -> UnitCounts {
        let mut counts = UnitCounts::default();
        let adapter = okazje_adapters::adapter_for(platform);
        let Some(search_url) = adapter.search_url(keyword) else {
            return counts;
        };

        let doc = match self.fetcher.fetch(&search_url, platform).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%run_id, keyword, %platform, error = %err, "search fetch failed");
                counts.error = Some(format!("{keyword}/{platform}: {err}"));
                return counts;
            }
        };
        counts.fetched = 1;

        let hits = match adapter.parse_search(&doc) {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%run_id, keyword, %platform, error = %err, "search parse failed");
                counts.error = Some(format!("{keyword}/{platform}: {err}"));
                return counts;
            }
        };

        for hit in hits {
            counts.parsed += 1;
            let url = hit.url.clone();
            let listing = match normalize(platform, url.as_deref(), &hit, doc.fetched_at) {
                Ok(listing) => listing,
                Err(err) => {
                    debug!(%run_id, keyword, %platform, error = %err, "normalization rejected hit");
                    counts.normalization_failures += 1;
                    continue;
                }
            };

            // Atomic dedup gate shared by all concurrent units.
            match self.seen.check_and_mark(&listing.id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    counts.duplicates += 1;
                    continue;
                }
                Err(err) => {
                    warn!(%run_id, listing_id = %listing.id, error = %err, "seen-set write failed");
                    counts.error = Some(format!("{keyword}/{platform}: {err}"));
                    continue;
                }
            }

            counts.evaluated += 1;
            let result = assess_and_evaluate(&listing, self.assessor.as_ref(), &self.policy).await;
            if result.verdict == Verdict::Skip {
                // Recorded as seen above, so it will not be re-evaluated
                // every cycle; no notification goes out.
                continue;
            }
            if self.reports.send(ScanReport { listing, result }).await.is_ok() {
                counts.reported += 1;
            }
        }

        counts
    }
}

fn log_summary(summary: &CycleSummary) {
    info!(
        run_id = %summary.run_id,
        keywords = summary.keywords,
        fetched = summary.fetched,
        parsed = summary.parsed,
        normalization_failures = summary.normalization_failures,
        duplicates = summary.duplicates,
        evaluated = summary.evaluated,
        reported = summary.reported,
        errors = summary.errors.len(),
        "scan cycle complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use okazje_core::AuthenticityLabel;
    use okazje_storage::FetchError;
    use std::collections::HashMap;
    use tempfile::tempdir;

    struct StubFetch {
        pages: HashMap<String, String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Fetch for StubFetch {
        async fn fetch(&self, url: &str, platform: Platform) -> Result<RawDocument, FetchError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.pages.get(url) {
                Some(body) => Ok(RawDocument {
                    body: body.clone(),
                    url: Some(url.to_string()),
                    platform,
                    fetched_at: Utc::now(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                }),
            }
        }
    }

    struct FixedAssess {
        assessment: Assessment,
    }

    #[async_trait]
    impl Assess for FixedAssess {
        async fn assess(&self, _listing: &CanonicalListing) -> Result<Assessment, AssessmentError> {
            Ok(self.assessment.clone())
        }
    }

    struct FailingAssess;

    #[async_trait]
    impl Assess for FailingAssess {
        async fn assess(&self, _listing: &CanonicalListing) -> Result<Assessment, AssessmentError> {
            Err(AssessmentError::ProviderUnavailable("stub outage".to_string()))
        }
    }

    const SPRZEDAJEMY_SEARCH: &str = r#"<html><body>
        <a href="/zegarek-blonie-nr100">Zegarek Błonie Zodiak 200 zł</a>
        <a href="/zegarek-rakieta-nr200">Zegarek Rakieta 150 zł</a>
        <a href="/bez-ceny-nr300">Zegarek bez ceny</a>
    </body></html>"#;

    fn original(value: f64, confidence: f64) -> Assessment {
        Assessment {
            authenticity: AuthenticityLabel::Original,
            estimated_market_value: value,
            confidence,
            rationale: "stub".to_string(),
        }
    }

    fn stub_pages(keyword: &str) -> HashMap<String, String> {
        let mut pages = HashMap::new();
        pages.insert(
            format!("https://sprzedajemy.pl/szukaj?inp_text={keyword}"),
            SPRZEDAJEMY_SEARCH.to_string(),
        );
        // Gratka is left out on purpose: its fetch fails with a 503.
        pages
    }

    async fn test_monitor(
        dir: &std::path::Path,
        fetch: StubFetch,
        assessor: Arc<dyn Assess>,
    ) -> (Monitor, mpsc::Receiver<ScanReport>) {
        let seen = Arc::new(SeenSet::open(dir.join("seen.json")).await.unwrap());
        let keywords = Arc::new(KeywordStore::open(dir.join("keywords.json")).await.unwrap());
        for default in keywords.list().await {
            keywords.remove(&default).await.unwrap();
        }
        keywords.add("zegarek").await.unwrap();

        let (tx, rx) = mpsc::channel(64);
        let monitor = Monitor::new(
            &ScanConfig::default(),
            Arc::new(fetch),
            assessor,
            seen,
            keywords,
            tx,
        );
        (monitor, rx)
    }

    #[test]
    fn non_positive_config_is_rejected() {
        let mut config = ScanConfig::default();
        config.max_price = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::MaxPrice(0.0)));

        let mut config = ScanConfig::default();
        config.min_margin_percent = -5.0;
        assert_eq!(config.validate(), Err(ConfigError::MinMargin(-5.0)));

        let mut config = ScanConfig::default();
        config.scan_interval_minutes = 0;
        assert_eq!(config.validate(), Err(ConfigError::ScanInterval));

        let mut config = ScanConfig::default();
        config.seen_retention_days = -7;
        assert_eq!(config.validate(), Err(ConfigError::SeenRetention(-7)));

        assert_eq!(ScanConfig::default().validate(), Ok(()));
    }

    #[tokio::test]
    async fn cycle_reports_new_listings_and_counts_failures() {
        let dir = tempdir().unwrap();
        let fetch = StubFetch {
            pages: stub_pages("zegarek"),
            delay: None,
        };
        let assessor = Arc::new(FixedAssess {
            assessment: original(700.0, 0.9),
        });
        let (monitor, mut rx) = test_monitor(dir.path(), fetch, assessor).await;

        let summary = monitor.try_scan().await.unwrap().expect("cycle ran");
        assert_eq!(summary.keywords, 1);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.parsed, 3);
        // "Zegarek bez ceny" carries no price text.
        assert_eq!(summary.normalization_failures, 1);
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.reported, 2);
        // Gratka search page is unavailable in the stub.
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("gratka"));

        let report = rx.recv().await.unwrap();
        assert_eq!(report.result.verdict, Verdict::Buy);
        assert!(report.listing.title.starts_with("Zegarek"));
    }

    #[tokio::test]
    async fn second_identical_cycle_reports_nothing_new() {
        let dir = tempdir().unwrap();
        let assessor: Arc<dyn Assess> = Arc::new(FixedAssess {
            assessment: original(700.0, 0.9),
        });

        let fetch = StubFetch {
            pages: stub_pages("zegarek"),
            delay: None,
        };
        let (monitor, mut rx) = test_monitor(dir.path(), fetch, assessor).await;

        let first = monitor.try_scan().await.unwrap().unwrap();
        assert_eq!(first.reported, 2);
        let second = monitor.try_scan().await.unwrap().unwrap();
        assert_eq!(second.reported, 0);
        assert_eq!(second.duplicates, 2);

        // Exactly the first cycle's reports are in the channel.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn skip_verdicts_are_recorded_seen_but_not_reported() {
        let dir = tempdir().unwrap();
        // Market value below asking price: insufficient margin, Skip.
        let assessor: Arc<dyn Assess> = Arc::new(FixedAssess {
            assessment: original(100.0, 0.9),
        });
        let fetch = StubFetch {
            pages: stub_pages("zegarek"),
            delay: None,
        };
        let (monitor, mut rx) = test_monitor(dir.path(), fetch, assessor).await;

        let summary = monitor.try_scan().await.unwrap().unwrap();
        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.reported, 0);
        assert!(rx.try_recv().is_err());

        // Unattractive listings are not re-evaluated next cycle.
        let second = monitor.try_scan().await.unwrap().unwrap();
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.evaluated, 0);
    }

    #[tokio::test]
    async fn assessment_outage_degrades_to_investigate() {
        let dir = tempdir().unwrap();
        let fetch = StubFetch {
            pages: stub_pages("zegarek"),
            delay: None,
        };
        let (monitor, mut rx) = test_monitor(dir.path(), fetch, Arc::new(FailingAssess)).await;

        let summary = monitor.try_scan().await.unwrap().unwrap();
        assert_eq!(summary.reported, 2);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.result.verdict, Verdict::Investigate);
        assert_eq!(report.result.reasons, vec!["valuation unavailable"]);

        // Still deduplicated on the next cycle.
        let second = monitor.try_scan().await.unwrap().unwrap();
        assert_eq!(second.duplicates, 2);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_coalesced() {
        let dir = tempdir().unwrap();
        let fetch = StubFetch {
            pages: stub_pages("zegarek"),
            delay: Some(Duration::from_millis(300)),
        };
        let assessor: Arc<dyn Assess> = Arc::new(FixedAssess {
            assessment: original(700.0, 0.9),
        });
        let (monitor, _rx) = test_monitor(dir.path(), fetch, assessor).await;
        let monitor = Arc::new(monitor);

        let first = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.try_scan().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let coalesced = monitor.try_scan().await.unwrap();
        assert!(coalesced.is_none());

        let summary = first.await.unwrap().unwrap().expect("first cycle ran");
        assert_eq!(summary.reported, 2);
    }

    #[tokio::test]
    async fn run_forever_scans_on_interval_and_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let fetch = StubFetch {
            pages: stub_pages("zegarek"),
            delay: None,
        };
        let assessor: Arc<dyn Assess> = Arc::new(FixedAssess {
            assessment: original(700.0, 0.9),
        });
        let (monitor, mut rx) = test_monitor(dir.path(), fetch, assessor).await;
        let monitor = Arc::new(monitor);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .run_forever(Duration::from_millis(50), shutdown_rx)
                    .await
            })
        };

        // The first interval tick runs a full cycle and delivers its reports.
        let report = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("interval cycle produced a report")
            .unwrap();
        assert_eq!(report.result.verdict, Verdict::Buy);

        // Flipping the watch channel stops the loop instead of leaving it
        // ticking forever.
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("monitor loop stopped on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn cycle_larger_than_channel_capacity_completes_with_concurrent_drain() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(SeenSet::open(dir.path().join("seen.json")).await.unwrap());
        let keywords = Arc::new(KeywordStore::open(dir.path().join("keywords.json")).await.unwrap());
        for default in keywords.list().await {
            keywords.remove(&default).await.unwrap();
        }
        keywords.add("zegarek").await.unwrap();

        // Two qualifying listings against a capacity-1 channel: the cycle
        // must only ever block until the receiver catches up, never wedge.
        let (tx, mut rx) = mpsc::channel(1);
        let monitor = Monitor::new(
            &ScanConfig::default(),
            Arc::new(StubFetch {
                pages: stub_pages("zegarek"),
                delay: None,
            }),
            Arc::new(FixedAssess {
                assessment: original(700.0, 0.9),
            }),
            seen,
            keywords,
            tx,
        );

        let drain = tokio::spawn(async move {
            let mut reports = Vec::new();
            while let Some(report) = rx.recv().await {
                reports.push(report);
            }
            reports
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), monitor.try_scan())
            .await
            .expect("cycle finished")
            .unwrap()
            .unwrap();
        assert_eq!(summary.reported, 2);

        drop(monitor);
        let reports = drain.await.unwrap();
        assert_eq!(reports.len(), 2);
    }

    #[tokio::test]
    async fn analyze_document_marks_seen_and_reports() {
        let dir = tempdir().unwrap();
        let seen = SeenSet::open(dir.path().join("seen.json")).await.unwrap();
        let assessor = FailingAssess;
        let policy = ScanConfig::default().policy();

        let doc = RawDocument {
            body: "Szabla oficerska wz. 21\nStan dobry, 450 zł".to_string(),
            url: None,
            platform: Platform::Manual,
            fetched_at: Utc::now(),
        };
        let report = analyze_document(&doc, &assessor, &policy, &seen).await.unwrap();
        assert_eq!(report.result.verdict, Verdict::Investigate);
        assert_eq!(report.result.reasons, vec!["valuation unavailable"]);
        assert_eq!(report.listing.price, 450.0);
        assert!(seen.has_seen(&report.listing.id).await);
    }
}

//! Persistent scan state (seen-set, keywords) + HTTP fetch utilities.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use okazje_core::{Platform, RawDocument};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "okazje-storage";

/// Monitoring keywords seeded into a fresh keyword store.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "komiks PRL",
    "Relax komiks",
    "Kapitan Żbik",
    "figurka Ćmielów",
    "porcelana PRL",
    "zegarek Błonie",
    "zegarek Rakieta",
    "zegarek Wostok",
    "obraz olejny",
    "szabla",
    "bagnet",
    "Lem pierwsze wydanie",
    "Sapkowski wydanie",
    "ikona prawosławna",
    "sztućce srebrne",
    "kordelas",
];

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating state directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err)
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()));
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SeenFile {
    seen: BTreeMap<String, DateTime<Utc>>,
}

/// Append-only record of listing ids already reported, persisted as JSON.
/// Check-and-mark is a single critical section so concurrent scan workers
/// cannot both observe "not seen" for the same id.
#[derive(Debug)]
pub struct SeenSet {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl SeenSet {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let seen = match fs::read_to_string(&path).await {
            Ok(text) => {
                let file: SeenFile = serde_json::from_str(&text)
                    .with_context(|| format!("parsing seen-set file {}", path.display()))?;
                file.seen
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading seen-set file {}", path.display()))
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(seen),
        })
    }

    async fn persist(&self, seen: &BTreeMap<String, DateTime<Utc>>) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&SeenFile { seen: seen.clone() })
            .context("serializing seen-set")?;
        write_atomically(&self.path, &bytes).await
    }

    pub async fn has_seen(&self, id: &str) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    /// Idempotent: re-marking a seen id keeps its original `first_seen_at`.
    pub async fn mark_seen(&self, id: &str, first_seen_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.check_and_mark(id, first_seen_at).await?;
        Ok(())
    }

    /// Atomic dedup gate: returns true when the id was newly marked.
    pub async fn check_and_mark(
        &self,
        id: &str,
        first_seen_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut seen = self.inner.lock().await;
        if seen.contains_key(id) {
            return Ok(false);
        }
        seen.insert(id.to_string(), first_seen_at);
        self.persist(&seen).await?;
        Ok(true)
    }

    /// Drop entries whose first sighting is strictly older than the retention
    /// window. Anything younger stays and keeps suppressing re-reports.
    pub async fn evict_older_than(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let cutoff = now - retention;
        let mut seen = self.inner.lock().await;
        let before = seen.len();
        seen.retain(|_, first_seen_at| *first_seen_at >= cutoff);
        let evicted = before - seen.len();
        if evicted > 0 {
            self.persist(&seen).await?;
            debug!(evicted, remaining = seen.len(), "seen-set eviction");
        }
        Ok(evicted)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum KeywordError {
    #[error("keyword already present: {0}")]
    Duplicate(String),
    #[error("keyword not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Ordered, case-preserving keyword list with case-insensitive membership,
/// persisted as a JSON array. A fresh store is seeded with the default
/// collector keywords.
#[derive(Debug)]
pub struct KeywordStore {
    path: PathBuf,
    inner: Mutex<Vec<String>>,
}

impl KeywordStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let keywords = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("parsing keyword file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading keyword file {}", path.display()))
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(keywords),
        })
    }

    async fn persist(&self, keywords: &[String]) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(keywords).context("serializing keywords")?;
        write_atomically(&self.path, &bytes).await
    }

    pub async fn list(&self) -> Vec<String> {
        self.inner.lock().await.clone()
    }

    pub async fn add(&self, keyword: &str) -> Result<(), KeywordError> {
        let keyword = keyword.trim();
        let mut keywords = self.inner.lock().await;
        if keywords
            .iter()
            .any(|k| k.to_lowercase() == keyword.to_lowercase())
        {
            return Err(KeywordError::Duplicate(keyword.to_string()));
        }
        keywords.push(keyword.to_string());
        self.persist(&keywords).await?;
        Ok(())
    }

    pub async fn remove(&self, keyword: &str) -> Result<(), KeywordError> {
        let keyword = keyword.trim();
        let mut keywords = self.inner.lock().await;
        let Some(idx) = keywords
            .iter()
            .position(|k| k.to_lowercase() == keyword.to_lowercase())
        else {
            return Err(KeywordError::NotFound(keyword.to_string()));
        };
        keywords.remove(idx);
        self.persist(&keywords).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_platform_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            per_platform_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// All fetch failures are "listing source unavailable" to the pipeline; the
/// kind survives for diagnostics only.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("network error for {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Fetch provider seam: production uses [`HttpFetcher`], tests inject stubs.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, platform: Platform) -> Result<RawDocument, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_platform_limit: usize,
    per_platform: Mutex<HashMap<Platform, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("pl-PL,pl;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        builder = builder.default_headers(headers);

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_platform_limit: config.per_platform_concurrency.max(1),
            per_platform: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_platform_semaphore(&self, platform: Platform) -> Arc<Semaphore> {
        let mut map = self.per_platform.lock().await;
        map.entry(platform)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_platform_limit)))
            .clone()
    }

    async fn fetch_inner(&self, url: &str, platform: Platform) -> Result<RawDocument, FetchError> {
        // The semaphores are never closed, so a failed acquire only means we
        // proceed unthrottled instead of aborting the fetch.
        let _global = self.global_limit.acquire().await.ok();
        let per_platform = self.per_platform_semaphore(platform).await;
        let _platform = per_platform.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %platform, url);
        let _guard = span.enter();

        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await.map_err(|source| FetchError::Network {
                            url: final_url.clone(),
                            source,
                        })?;
                        return Ok(RawDocument {
                            body,
                            url: Some(final_url),
                            platform,
                            fetched_at: Utc::now(),
                        });
                    }

                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
                Err(source) => {
                    let retryable = classify_reqwest_error(&source) == RetryDisposition::Retryable;
                    let err = if source.is_timeout() {
                        FetchError::Timeout {
                            url: url.to_string(),
                        }
                    } else {
                        FetchError::Network {
                            url: url.to_string(),
                            source,
                        }
                    };
                    if retryable && attempt < self.backoff.max_retries {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, platform: Platform) -> Result<RawDocument, FetchError> {
        self.fetch_inner(url, platform).await
    }
}

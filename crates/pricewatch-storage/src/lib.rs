//! Persistent item/bucket storage + HTTP page fetching for pricewatch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{ExtensionConfig, PricePoint, RateLimitBucket, TrackedItem};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt document {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no tracked item with id {0}")]
    UnknownItem(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Partial update applied to a single stored item. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    pub current_price: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub price_history: Option<Vec<PricePoint>>,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub is_active: Option<bool>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, item: &mut TrackedItem) {
        if let Some(price) = self.current_price {
            item.current_price = price;
        }
        if let Some(at) = self.last_checked_at {
            item.last_checked_at = Some(at);
        }
        if let Some(history) = &self.price_history {
            item.price_history = history.clone();
        }
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(image_url) = &self.image_url {
            item.image_url = Some(image_url.clone());
        }
        if let Some(active) = self.is_active {
            item.is_active = active;
        }
    }
}

/// Async key-value access to tracked items, rate-limit buckets and config.
///
/// Items keep their insertion order; `load_items` returns them in that order.
/// Every `put_*` is replace-or-create for its key.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_items(&self) -> Result<Vec<TrackedItem>, StoreError>;
    async fn get_item(&self, id: Uuid) -> Result<Option<TrackedItem>, StoreError>;
    async fn put_item(&self, item: &TrackedItem) -> Result<(), StoreError>;
    async fn update_item(&self, id: Uuid, patch: &ItemPatch) -> Result<TrackedItem, StoreError>;
    async fn remove_item(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn load_buckets(&self) -> Result<Vec<RateLimitBucket>, StoreError>;
    async fn put_bucket(&self, bucket: &RateLimitBucket) -> Result<(), StoreError>;
    async fn delete_bucket(&self, domain: &str) -> Result<bool, StoreError>;

    /// Raw config document; interpretation (and fallback) belongs to the caller.
    async fn load_config(&self) -> Result<Option<JsonValue>, StoreError>;
    async fn save_config(&self, config: &ExtensionConfig) -> Result<(), StoreError>;

    async fn last_sweep_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn set_last_sweep_at(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    items: Vec<TrackedItem>,
    #[serde(default)]
    buckets: BTreeMap<String, RateLimitBucket>,
    #[serde(default)]
    config: Option<JsonValue>,
    #[serde(default)]
    last_sweep_at: Option<DateTime<Utc>>,
}

impl StoreState {
    fn upsert_item(&mut self, item: &TrackedItem) {
        match self.items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item.clone(),
            None => self.items.push(item.clone()),
        }
    }

    fn patch_item(&mut self, id: Uuid, patch: &ItemPatch) -> Result<TrackedItem, StoreError> {
        let item = self
            .items
            .iter_mut()
            .find(|existing| existing.id == id)
            .ok_or(StoreError::UnknownItem(id))?;
        patch.apply(item);
        Ok(item.clone())
    }

    fn remove_item(&mut self, id: Uuid) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }
}

/// Process-local store, used for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<TrackedItem>) -> Self {
        Self {
            state: Mutex::new(StoreState {
                items,
                ..Default::default()
            }),
        }
    }

    pub async fn set_raw_config(&self, value: JsonValue) {
        self.state.lock().await.config = Some(value);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        Ok(self.state.lock().await.items.clone())
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<TrackedItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.items.iter().find(|item| item.id == id).cloned())
    }

    async fn put_item(&self, item: &TrackedItem) -> Result<(), StoreError> {
        self.state.lock().await.upsert_item(item);
        Ok(())
    }

    async fn update_item(&self, id: Uuid, patch: &ItemPatch) -> Result<TrackedItem, StoreError> {
        self.state.lock().await.patch_item(id, patch)
    }

    async fn remove_item(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.remove_item(id))
    }

    async fn load_buckets(&self) -> Result<Vec<RateLimitBucket>, StoreError> {
        Ok(self.state.lock().await.buckets.values().cloned().collect())
    }

    async fn put_bucket(&self, bucket: &RateLimitBucket) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .buckets
            .insert(bucket.domain.clone(), bucket.clone());
        Ok(())
    }

    async fn delete_bucket(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.buckets.remove(domain).is_some())
    }

    async fn load_config(&self) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.state.lock().await.config.clone())
    }

    async fn save_config(&self, config: &ExtensionConfig) -> Result<(), StoreError> {
        let value = serde_json::to_value(config)
            .map_err(|e| StoreError::Unavailable(format!("serializing config: {e}")))?;
        self.state.lock().await.config = Some(value);
        Ok(())
    }

    async fn last_sweep_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.lock().await.last_sweep_at)
    }

    async fn set_last_sweep_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.state.lock().await.last_sweep_at = Some(at);
        Ok(())
    }
}

const ITEMS_FILE: &str = "items.json";
const BUCKETS_FILE: &str = "buckets.json";
const CONFIG_FILE: &str = "config.json";
const SWEEP_STATE_FILE: &str = "sweep_state.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SweepStateDoc {
    last_sweep_at: Option<DateTime<Utc>>,
}

/// One JSON document per collection under `root`, each replaced atomically
/// via temp-file + rename.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_doc<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StoreError> {
        let path = self.root.join(name);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        if text.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Corrupt { path, source })
    }

    async fn read_raw(&self, name: &str) -> Result<Option<JsonValue>, StoreError> {
        let path = self.root.join(name);
        match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { path, source }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn write_doc<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.root.join(name);
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|source| StoreError::Corrupt { path: path.clone(), source })?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        self.read_doc(ITEMS_FILE).await
    }

    async fn buckets(&self) -> Result<BTreeMap<String, RateLimitBucket>, StoreError> {
        self.read_doc(BUCKETS_FILE).await
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "doc".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn load_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        self.items().await
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<TrackedItem>, StoreError> {
        Ok(self.items().await?.into_iter().find(|item| item.id == id))
    }

    async fn put_item(&self, item: &TrackedItem) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut state = StoreState {
            items: self.items().await?,
            ..Default::default()
        };
        state.upsert_item(item);
        self.write_doc(ITEMS_FILE, &state.items).await
    }

    async fn update_item(&self, id: Uuid, patch: &ItemPatch) -> Result<TrackedItem, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut state = StoreState {
            items: self.items().await?,
            ..Default::default()
        };
        let updated = state.patch_item(id, patch)?;
        self.write_doc(ITEMS_FILE, &state.items).await?;
        Ok(updated)
    }

    async fn remove_item(&self, id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut state = StoreState {
            items: self.items().await?,
            ..Default::default()
        };
        let removed = state.remove_item(id);
        if removed {
            self.write_doc(ITEMS_FILE, &state.items).await?;
        }
        Ok(removed)
    }

    async fn load_buckets(&self) -> Result<Vec<RateLimitBucket>, StoreError> {
        Ok(self.buckets().await?.into_values().collect())
    }

    async fn put_bucket(&self, bucket: &RateLimitBucket) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut buckets = self.buckets().await?;
        buckets.insert(bucket.domain.clone(), bucket.clone());
        self.write_doc(BUCKETS_FILE, &buckets).await
    }

    async fn delete_bucket(&self, domain: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut buckets = self.buckets().await?;
        if buckets.remove(domain).is_none() {
            return Ok(false);
        }
        self.write_doc(BUCKETS_FILE, &buckets).await?;
        Ok(true)
    }

    async fn load_config(&self) -> Result<Option<JsonValue>, StoreError> {
        self.read_raw(CONFIG_FILE).await
    }

    async fn save_config(&self, config: &ExtensionConfig) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_doc(CONFIG_FILE, config).await
    }

    async fn last_sweep_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let doc: SweepStateDoc = self.read_doc(SWEEP_STATE_FILE).await?;
        Ok(doc.last_sweep_at)
    }

    async fn set_last_sweep_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_doc(
            SWEEP_STATE_FILE,
            &SweepStateDoc {
                last_sweep_at: Some(at),
            },
        )
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Throttling answers (403/429) are never retried in-request; the domain backoff
/// handles them.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
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

/// In-request retry schedule. Domain-level backoff across sweeps lives in the rate limiter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
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
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Origins answering 403/429 are signalling throttling rather than a broken page.
    pub fn is_throttled(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 403 | 429, .. })
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
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

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_page(&self, domain: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", domain, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying fetch");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        debug!(error = %err, attempt, "retrying fetch");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

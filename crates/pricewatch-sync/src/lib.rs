//! Sweep orchestration: rate limiting, price checks, notifications and scheduling.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pricewatch_adapters::{
    ExtractionError, ExtractionRegistry, HttpExtractor, SiteCatalog, SiteResolver,
};
use pricewatch_core::{PriceDropEvent, SupportTier, SweepSummary, TrackedItem};
use pricewatch_storage::{FetchError, HttpClientConfig, HttpFetcher, JsonFileStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod limiter;
pub mod orchestrator;

pub use limiter::{backoff_minutes, RateLimiter, BACKOFF_MINUTES};
pub use orchestrator::{
    apply_result, AppliedResult, CheckOrchestrator, ItemCheckOutcome, Observation,
    DEFAULT_INTER_ITEM_DELAY,
};

pub const CRATE_NAME: &str = "pricewatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sites_file: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub inter_item_delay_ms: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("PRICEWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sites_file: std::env::var("PRICEWATCH_SITES_FILE").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("PRICEWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            user_agent: std::env::var("PRICEWATCH_USER_AGENT")
                .unwrap_or_else(|_| "pricewatch/0.1".to_string()),
            http_timeout_secs: std::env::var("PRICEWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            inter_item_delay_ms: std::env::var("PRICEWATCH_INTER_ITEM_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
        }
    }
}

/// Why a single item check failed. Every variant counts against the domain's backoff.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("transport: {0}")]
    Transport(#[source] FetchError),
    #[error("extraction: {0}")]
    Extraction(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl CheckError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, CheckError::Transport(err) if err.is_throttled())
    }
}

impl From<ExtractionError> for CheckError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::Transport(err) => CheckError::Transport(err),
            ExtractionError::Unsupported { tier } => {
                CheckError::Unavailable(format!("no extraction capability for tier {tier}"))
            }
            err @ (ExtractionError::NoPrice { .. } | ExtractionError::InvalidSelector { .. }) => {
                CheckError::Extraction(err.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,
    #[error("cannot read tracked items: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("not an http(s) url: {0}")]
    InvalidUrl(String),
    #[error("item {0} is already tracked")]
    AlreadyTracked(Uuid),
    #[error("no tracked item with id {0}")]
    UnknownItem(Uuid),
    #[error("tracking limit of {max} items reached")]
    LimitReached { max: usize },
    #[error("{domain} is backing off for another {minutes} min")]
    RateLimited { domain: String, minutes: i64 },
    #[error("{url} is not a supported product page (tier {tier})")]
    Unsupported { url: String, tier: SupportTier },
    #[error(transparent)]
    Check(#[from] CheckError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Receives each qualifying price drop once.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &PriceDropEvent) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, event: &PriceDropEvent) -> Result<()> {
        info!(
            item_id = %event.item_id,
            title = %event.title,
            old_price = event.old_price,
            new_price = event.new_price,
            percent_drop = format!("{:.1}", event.percent_drop),
            url = %event.url,
            "price dropped"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    events: Mutex<Vec<PriceDropEvent>>,
}

impl RecordingNotificationSink {
    pub async fn events(&self) -> Vec<PriceDropEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, event: &PriceDropEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Period between scheduled sweeps for a stored interval in minutes.
pub fn sweep_interval(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(1).saturating_mul(60))
}

/// Single logical worker. Sweeps never overlap; manual additions wait for the
/// running sweep to finish.
pub struct SweepScheduler {
    orchestrator: CheckOrchestrator,
    running: Mutex<()>,
    active: StdMutex<Option<CancellationToken>>,
}

impl SweepScheduler {
    pub fn new(orchestrator: CheckOrchestrator) -> Self {
        Self {
            orchestrator,
            running: Mutex::new(()),
            active: StdMutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &CheckOrchestrator {
        &self.orchestrator
    }

    pub async fn run_sweep(&self) -> Result<SweepSummary, SweepError> {
        let Ok(_guard) = self.running.try_lock() else {
            return Err(SweepError::AlreadyRunning);
        };
        let token = CancellationToken::new();
        self.set_active(Some(token.clone()));
        let result = self.orchestrator.run_sweep(&token).await;
        self.set_active(None);
        result
    }

    fn set_active(&self, token: Option<CancellationToken>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub async fn trigger_now(&self) -> Result<SweepSummary, SweepError> {
        info!("manual sweep requested");
        self.run_sweep().await
    }

    pub async fn track_item(
        &self,
        url: &str,
        selector_hint: Option<&str>,
    ) -> Result<TrackedItem, TrackError> {
        let _guard = self.running.lock().await;
        self.orchestrator.track_item(url, selector_hint).await
    }

    pub async fn check_item(&self, id: Uuid) -> Result<ItemCheckOutcome, TrackError> {
        let _guard = self.running.lock().await;
        self.orchestrator.check_item(id).await
    }

    /// Stops the running sweep at the next item boundary. Later sweeps are unaffected.
    pub fn cancel(&self) {
        if let Some(token) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    pub async fn start(self: Arc<Self>, every: Duration) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = self;
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                match scheduler.run_sweep().await {
                    Ok(summary) => debug!(run_id = %summary.run_id, "scheduled sweep done"),
                    Err(SweepError::AlreadyRunning) => {
                        info!("previous sweep still running; skipping tick")
                    }
                    Err(err) => warn!(error = %err, "scheduled sweep failed"),
                }
            })
        })
        .context("creating sweep job")?;
        sched.add(job).await.context("adding sweep job")?;
        sched.start().await.context("starting scheduler")?;
        Ok(sched)
    }

    /// Starts the periodic sweep at the stored check interval when enabled.
    pub async fn maybe_start(self: Arc<Self>, config: &SyncConfig) -> Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }
        let minutes = self.orchestrator.load_config().await.check_interval_minutes;
        info!(minutes, "periodic sweeps enabled");
        self.start(sweep_interval(minutes)).await.map(Some)
    }
}

/// Wires the HTTP extractor, file store and log sink from `config`.
pub fn build_scheduler(config: &SyncConfig) -> Result<SweepScheduler> {
    let catalog = match &config.sites_file {
        Some(path) => SiteCatalog::load_with_extension(path)?,
        None => SiteCatalog::default(),
    };
    let registry =
        ExtractionRegistry::with_builtin_adapters(&catalog).context("building extraction registry")?;
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;

    let orchestrator = CheckOrchestrator::new(
        Arc::new(JsonFileStore::new(config.data_dir.clone())),
        Arc::new(HttpExtractor::new(fetcher, Arc::new(registry))),
        Arc::new(LogNotificationSink),
        Arc::new(SiteResolver::new(catalog)),
    )
    .with_inter_item_delay(Duration::from_millis(config.inter_item_delay_ms));
    Ok(SweepScheduler::new(orchestrator))
}

//! The sweep: walk active items in stored order, check each one, and turn the
//! outcome into store updates, limiter bookkeeping and drop notifications.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pricewatch_adapters::{
    canonical_url, domain_for_url, normalize_host, ExtractionHint, ExtractionRequest,
    PageExtractor, SiteResolver, TierClassification,
};
use pricewatch_core::{
    ExtensionConfig, ExtractedProduct, PriceDropEvent, SupportTier, SweepSummary, TrackedItem,
    PRICE_EPSILON,
};
use pricewatch_storage::{ItemPatch, Store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::limiter::RateLimiter;
use crate::{CheckError, NotificationSink, SweepError, TrackError};

pub const DEFAULT_INTER_ITEM_DELAY: Duration = Duration::from_secs(1);

/// A successful check, reduced to what the sweep acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub price: f64,
    pub currency: Option<String>,
    pub title: Option<String>,
    pub image_url: Option<String>,
}

impl Observation {
    /// Out-of-stock pages and pages without a usable price are failures.
    pub fn from_product(product: ExtractedProduct, url: &str) -> Result<Self, CheckError> {
        if !product.available {
            return Err(CheckError::Unavailable(
                product.error.unwrap_or_else(|| "out of stock".to_string()),
            ));
        }
        match product.price {
            Some(price) if price.is_finite() && price > 0.0 => Ok(Self {
                price,
                currency: product.currency,
                title: product.title.filter(|t| !t.trim().is_empty()),
                image_url: product.image_url,
            }),
            _ => Err(CheckError::Extraction(format!("no price on {url}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResult {
    pub patch: ItemPatch,
    pub price_changed: bool,
    pub drop: Option<PriceDropEvent>,
}

/// Pure change detection for one observation.
///
/// History always records the observed value. `current_price` moves only when
/// the difference exceeds [`PRICE_EPSILON`], and a drop is reported only when it
/// reaches the configured percentage of the old price.
pub fn apply_result(
    item: &TrackedItem,
    observation: &Observation,
    observed_at: DateTime<Utc>,
    config: &ExtensionConfig,
) -> AppliedResult {
    let old_price = item.current_price;
    let new_price = observation.price;
    let delta = old_price - new_price;
    let price_changed = delta.abs() > PRICE_EPSILON;

    let mut updated = item.clone();
    updated.push_history(new_price, observed_at, config.max_history_entries);

    let title = match &observation.title {
        Some(title) if item.title.trim().is_empty() => Some(title.clone()),
        _ => None,
    };

    let drop = if price_changed && delta > 0.0 && old_price > 0.0 {
        let percent_drop = delta * 100.0 / old_price;
        (percent_drop >= config.price_drop_threshold_percent).then(|| PriceDropEvent {
            item_id: item.id,
            title: title.clone().unwrap_or_else(|| item.title.clone()),
            old_price,
            new_price,
            percent_drop,
            url: item.url.clone(),
        })
    } else {
        None
    };

    AppliedResult {
        patch: ItemPatch {
            current_price: price_changed.then_some(new_price),
            last_checked_at: Some(observed_at),
            price_history: Some(updated.price_history),
            title,
            image_url: if item.image_url.is_none() {
                observation.image_url.clone()
            } else {
                None
            },
            is_active: None,
        },
        price_changed,
        drop,
    }
}

/// Maps a stored item and its current classification onto the capability to use.
fn extraction_target(
    item: &TrackedItem,
    classification: &TierClassification,
) -> Result<(SupportTier, Option<ExtractionHint>), CheckError> {
    match classification.tier {
        SupportTier::Specific | SupportTier::Whitelist if classification.product_page => {
            Ok((classification.tier, classification.extraction_hint))
        }
        SupportTier::Specific | SupportTier::Whitelist => {
            Err(CheckError::Unavailable("not a product page".to_string()))
        }
        SupportTier::Manual => Ok((SupportTier::Manual, Some(ExtractionHint::Selector))),
        SupportTier::None if item.tier_at_creation == SupportTier::Manual => {
            Ok((SupportTier::Manual, Some(ExtractionHint::Selector)))
        }
        SupportTier::None => Err(CheckError::Unavailable(
            "no extraction capability for this site".to_string(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemCheckOutcome {
    Skipped { minutes_until_retry: i64 },
    Updated {
        price_changed: bool,
        drop: Option<PriceDropEvent>,
    },
    Failed { reason: String },
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    skipped: usize,
}

pub struct CheckOrchestrator {
    store: Arc<dyn Store>,
    extractor: Arc<dyn PageExtractor>,
    notifier: Arc<dyn NotificationSink>,
    resolver: Arc<SiteResolver>,
    inter_item_delay: Duration,
}

impl CheckOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        extractor: Arc<dyn PageExtractor>,
        notifier: Arc<dyn NotificationSink>,
        resolver: Arc<SiteResolver>,
    ) -> Self {
        Self {
            store,
            extractor,
            notifier,
            resolver,
            inter_item_delay: DEFAULT_INTER_ITEM_DELAY,
        }
    }

    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn resolver(&self) -> &SiteResolver {
        &self.resolver
    }

    /// Stored config, or defaults when it is missing, malformed or unreadable.
    pub async fn load_config(&self) -> ExtensionConfig {
        match self.store.load_config().await {
            Ok(raw) => {
                let (config, err) = ExtensionConfig::from_json_value_or_default(raw);
                if let Some(err) = err {
                    warn!(error = %err, "stored config rejected; using defaults");
                }
                config
            }
            Err(err) => {
                warn!(error = %err, "cannot read stored config; using defaults");
                ExtensionConfig::default()
            }
        }
    }

    async fn load_limiter(&self) -> RateLimiter {
        match self.store.load_buckets().await {
            Ok(buckets) => RateLimiter::from_buckets(buckets),
            Err(err) => {
                warn!(error = %err, "cannot read rate-limit buckets; starting unrestricted");
                RateLimiter::new()
            }
        }
    }

    pub async fn run_sweep(&self, cancel: &CancellationToken) -> Result<SweepSummary, SweepError> {
        let run_id = Uuid::new_v4();
        self.sweep(run_id, cancel)
            .instrument(info_span!("sweep", %run_id))
            .await
    }

    async fn sweep(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, SweepError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let config = self.load_config().await;
        let items = self.store.load_items().await.map_err(|err| {
            warn!(error = %err, "cannot read tracked items; sweep aborted");
            SweepError::Store(err)
        })?;
        let mut limiter = self.load_limiter().await;

        let mut tally = Tally::default();
        let mut cancelled = false;
        let mut evaluated_any = false;

        for item in items.iter().filter(|item| item.is_active) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let now = Utc::now();
            if !limiter.is_allowed_at(&item.domain, now) {
                debug!(
                    item_id = %item.id,
                    domain = %item.domain,
                    minutes = limiter.minutes_until_retry_at(&item.domain, now),
                    "domain in backoff; skipping"
                );
                tally.skipped += 1;
                continue;
            }

            if evaluated_any && !self.inter_item_delay.is_zero() {
                let interrupted = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(self.inter_item_delay) => false,
                };
                if interrupted {
                    cancelled = true;
                    break;
                }
            }
            evaluated_any = true;

            match self.process_item(item, &config, &mut limiter).await {
                ItemCheckOutcome::Updated { .. } => tally.succeeded += 1,
                ItemCheckOutcome::Failed { .. } => tally.failed += 1,
                ItemCheckOutcome::Skipped { .. } => tally.skipped += 1,
            }
        }

        let finished_at = Utc::now();
        if !cancelled {
            if let Err(err) = self.store.set_last_sweep_at(finished_at).await {
                warn!(error = %err, "failed to record sweep time");
            }
        }

        let summary = SweepSummary {
            run_id,
            started_at,
            finished_at,
            checked: tally.succeeded + tally.failed,
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: tally.skipped,
            duration_ms: clock.elapsed().as_millis() as u64,
            cancelled,
        };
        info!(
            checked = summary.checked,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            cancelled,
            "sweep finished"
        );
        Ok(summary)
    }

    /// On-demand check of one stored item through the sweep path.
    pub async fn check_item(&self, id: Uuid) -> Result<ItemCheckOutcome, TrackError> {
        let item = self
            .store
            .get_item(id)
            .await?
            .ok_or(TrackError::UnknownItem(id))?;
        let config = self.load_config().await;
        let mut limiter = self.load_limiter().await;

        let now = Utc::now();
        if !limiter.is_allowed_at(&item.domain, now) {
            return Ok(ItemCheckOutcome::Skipped {
                minutes_until_retry: limiter.minutes_until_retry_at(&item.domain, now),
            });
        }
        Ok(self.process_item(&item, &config, &mut limiter).await)
    }

    async fn process_item(
        &self,
        item: &TrackedItem,
        config: &ExtensionConfig,
        limiter: &mut RateLimiter,
    ) -> ItemCheckOutcome {
        let evaluation = Uuid::new_v4();
        let result = self
            .evaluate(item)
            .instrument(info_span!("check_item", item_id = %item.id, domain = %item.domain))
            .await;
        let now = Utc::now();

        let observation = match result {
            Ok(observation) => observation,
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    item_id = %item.id,
                    domain = %item.domain,
                    throttled = err.is_throttled(),
                    %reason,
                    "price check failed"
                );
                self.record_failure(limiter, &item.domain, &reason, evaluation, now)
                    .await;
                return ItemCheckOutcome::Failed { reason };
            }
        };

        let applied = apply_result(item, &observation, now, config);
        if let Err(err) = self.store.update_item(item.id, &applied.patch).await {
            warn!(item_id = %item.id, error = %err, "failed to persist price update");
            return ItemCheckOutcome::Failed {
                reason: err.to_string(),
            };
        }

        if let Some(event) = &applied.drop {
            info!(
                item_id = %item.id,
                old_price = event.old_price,
                new_price = event.new_price,
                percent_drop = event.percent_drop,
                "price drop"
            );
            if let Err(err) = self.notifier.notify(event).await {
                warn!(item_id = %item.id, error = %err, "notification sink failed");
            }
        }

        self.record_success(limiter, &item.domain).await;
        debug!(
            item_id = %item.id,
            price = observation.price,
            changed = applied.price_changed,
            "price checked"
        );
        ItemCheckOutcome::Updated {
            price_changed: applied.price_changed,
            drop: applied.drop,
        }
    }

    async fn evaluate(&self, item: &TrackedItem) -> Result<Observation, CheckError> {
        let classification = self.resolver.classify(&item.url);
        let (tier, hint) = extraction_target(item, &classification)?;
        let product = self
            .extractor
            .extract(&ExtractionRequest {
                url: &item.url,
                domain: &item.domain,
                tier,
                hint,
                html: None,
                selector_hint: item.selector_hint.as_deref(),
            })
            .await?;
        Observation::from_product(product, &item.url)
    }

    async fn record_success(&self, limiter: &mut RateLimiter, domain: &str) {
        if limiter.record_success(domain) {
            if let Err(err) = self.store.delete_bucket(&normalize_host(domain)).await {
                warn!(%domain, error = %err, "failed to clear rate-limit bucket");
            }
        }
    }

    async fn record_failure(
        &self,
        limiter: &mut RateLimiter,
        domain: &str,
        reason: &str,
        evaluation: Uuid,
        now: DateTime<Utc>,
    ) {
        let bucket = limiter
            .record_failure_for(domain, reason, evaluation, now)
            .clone();
        if let Err(err) = self.store.put_bucket(&bucket).await {
            warn!(%domain, error = %err, "failed to persist rate-limit bucket");
        }
    }

    /// Adds a page to the watch list after a first successful check.
    pub async fn track_item(
        &self,
        url: &str,
        selector_hint: Option<&str>,
    ) -> Result<TrackedItem, TrackError> {
        let canonical =
            canonical_url(url).ok_or_else(|| TrackError::InvalidUrl(url.trim().to_string()))?;
        let url = canonical.as_str();
        let domain = domain_for_url(url).ok_or_else(|| TrackError::InvalidUrl(url.to_string()))?;

        let id = TrackedItem::id_for_url(url);
        let items = self.store.load_items().await?;
        if items.iter().any(|item| item.id == id) {
            return Err(TrackError::AlreadyTracked(id));
        }

        let config = self.load_config().await;
        let active = items.iter().filter(|item| item.is_active).count();
        if active >= config.max_tracked_items {
            return Err(TrackError::LimitReached {
                max: config.max_tracked_items,
            });
        }

        let mut limiter = self.load_limiter().await;
        let now = Utc::now();
        if !limiter.is_allowed_at(&domain, now) {
            return Err(TrackError::RateLimited {
                minutes: limiter.minutes_until_retry_at(&domain, now),
                domain,
            });
        }

        let evaluation = Uuid::new_v4();
        let (classification, observation) = match self
            .first_check(url, &domain, selector_hint)
            .instrument(info_span!("track_item", %domain))
            .await
        {
            Ok(checked) => checked,
            Err(TrackError::Check(err)) => {
                self.record_failure(&mut limiter, &domain, &err.to_string(), evaluation, Utc::now())
                    .await;
                return Err(TrackError::Check(err));
            }
            Err(err) => return Err(err),
        };
        self.record_success(&mut limiter, &domain).await;

        let now = Utc::now();
        let mut item = TrackedItem {
            id,
            url: url.to_string(),
            domain,
            title: observation.title.clone().unwrap_or_else(|| url.to_string()),
            currency: observation
                .currency
                .clone()
                .unwrap_or_else(|| "USD".to_string()),
            image_url: observation.image_url.clone(),
            site_name: classification.site_name.clone(),
            selector_hint: selector_hint.map(str::to_string),
            tier_at_creation: classification.tier,
            current_price: observation.price,
            initial_price: observation.price,
            created_at: now,
            last_checked_at: Some(now),
            price_history: Vec::new(),
            is_active: true,
        };
        item.push_history(observation.price, now, config.max_history_entries);
        self.store.put_item(&item).await?;
        info!(item_id = %item.id, tier = %item.tier_at_creation, price = item.current_price, "now tracking");
        Ok(item)
    }

    async fn first_check(
        &self,
        url: &str,
        domain: &str,
        selector_hint: Option<&str>,
    ) -> Result<(TierClassification, Observation), TrackError> {
        let mut classification = self.resolver.classify(url);
        let mut html = None;

        // Unknown domains need the document before they can score as manual.
        if classification.tier == SupportTier::None
            && !self.resolver.catalog().is_blacklisted(domain)
        {
            let document = self
                .extractor
                .fetch_document(url, domain)
                .await
                .map_err(CheckError::from)?;
            classification = self.resolver.classify_page(url, Some(&document));
            html = Some(document);
        }

        if !classification.is_actionable() {
            return Err(TrackError::Unsupported {
                url: url.to_string(),
                tier: classification.tier,
            });
        }

        let product = self
            .extractor
            .extract(&ExtractionRequest {
                url,
                domain,
                tier: classification.tier,
                hint: classification.extraction_hint,
                html: html.as_deref(),
                selector_hint,
            })
            .await
            .map_err(CheckError::from)?;
        let observation = Observation::from_product(product, url)?;
        Ok((classification, observation))
    }

    pub async fn list_items(&self) -> Result<Vec<TrackedItem>, TrackError> {
        Ok(self.store.load_items().await?)
    }

    pub async fn list_limits(&self) -> RateLimiter {
        self.load_limiter().await
    }

    /// Admin reset of one domain's backoff.
    pub async fn clear_limit(&self, domain: &str) -> Result<bool, TrackError> {
        Ok(self.store.delete_bucket(&normalize_host(domain)).await?)
    }
}

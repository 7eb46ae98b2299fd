//! Core domain model for pricewatch: tracked items, rate-limit buckets and sweep results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-core";

/// Price deltas at or below this value are treated as "unchanged".
pub const PRICE_EPSILON: f64 = 0.01;

/// Support category assigned to a URL/domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportTier {
    Specific,
    Whitelist,
    Manual,
    None,
}

impl SupportTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportTier::Specific => "specific",
            SupportTier::Whitelist => "whitelist",
            SupportTier::Manual => "manual",
            SupportTier::None => "none",
        }
    }
}

impl fmt::Display for SupportTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation in an item's price history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// A monitored product page bound to a single domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: Uuid,
    pub url: String,
    pub domain: String,
    pub title: String,
    pub currency: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub selector_hint: Option<String>,
    pub tier_at_creation: SupportTier,
    pub current_price: f64,
    pub initial_price: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub price_history: Vec<PricePoint>,
    pub is_active: bool,
}

impl TrackedItem {
    /// Stable item id derived from the canonical URL, so re-adding a URL maps to the same item.
    pub fn id_for_url(url: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes())
    }

    /// Appends an observation, keeping timestamps non-decreasing and evicting the
    /// oldest entries beyond `cap`.
    pub fn push_history(&mut self, price: f64, observed_at: DateTime<Utc>, cap: usize) {
        let timestamp = match self.price_history.last() {
            Some(last) if last.timestamp > observed_at => last.timestamp,
            _ => observed_at,
        };
        self.price_history.push(PricePoint { price, timestamp });
        let cap = cap.max(1);
        if self.price_history.len() > cap {
            let excess = self.price_history.len() - cap;
            self.price_history.drain(..excess);
        }
    }
}

/// Per-domain throttling state. Absent bucket means the domain is unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub domain: String,
    pub failure_count: u32,
    pub backoff_level: usize,
    pub next_retry_at: DateTime<Utc>,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_evaluation: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// User-tunable settings, read-only to the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    pub check_interval_minutes: u64,
    pub price_drop_threshold_percent: f64,
    pub max_history_entries: usize,
    pub max_tracked_items: usize,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 360,
            price_drop_threshold_percent: 5.0,
            max_history_entries: 100,
            max_tracked_items: 200,
        }
    }
}

impl ExtensionConfig {
    /// One week.
    pub const MAX_CHECK_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

    /// Parses a stored config document. Missing fields take defaults; wrong types
    /// or out-of-range values are errors.
    pub fn from_json_value(value: JsonValue) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Same as [`ExtensionConfig::from_json_value`] but never fails.
    pub fn from_json_value_or_default(value: Option<JsonValue>) -> (Self, Option<ConfigError>) {
        match value {
            None => (Self::default(), None),
            Some(value) => match Self::from_json_value(value) {
                Ok(config) => (config, None),
                Err(err) => (Self::default(), Some(err)),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=Self::MAX_CHECK_INTERVAL_MINUTES).contains(&self.check_interval_minutes) {
            return Err(ConfigError::Invalid {
                field: "check_interval_minutes",
                reason: format!(
                    "{} is outside 1..={}",
                    self.check_interval_minutes,
                    Self::MAX_CHECK_INTERVAL_MINUTES
                ),
            });
        }
        if !self.price_drop_threshold_percent.is_finite()
            || !(0.0..=100.0).contains(&self.price_drop_threshold_percent)
        {
            return Err(ConfigError::Invalid {
                field: "price_drop_threshold_percent",
                reason: format!("{} is outside 0..=100", self.price_drop_threshold_percent),
            });
        }
        if self.max_history_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_history_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_tracked_items == 0 {
            return Err(ConfigError::Invalid {
                field: "max_tracked_items",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Normalized handoff contract from extraction capabilities into the sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedProduct {
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub image_url: Option<String>,
    pub available: bool,
    pub error: Option<String>,
}

impl ExtractedProduct {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            title: None,
            price: None,
            currency: None,
            image_url: None,
            available: false,
            error: Some(reason.into()),
        }
    }
}

/// Raised once per qualifying price drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDropEvent {
    pub item_id: Uuid,
    pub title: String,
    pub old_price: f64,
    pub new_price: f64,
    pub percent_drop: f64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).single().unwrap()
    }

    fn item() -> TrackedItem {
        let url = "https://shop.example/p/widget-123";
        TrackedItem {
            id: TrackedItem::id_for_url(url),
            url: url.to_string(),
            domain: "shop.example".into(),
            title: "Widget".into(),
            currency: "USD".into(),
            image_url: None,
            site_name: None,
            selector_hint: None,
            tier_at_creation: SupportTier::Whitelist,
            current_price: 10.0,
            initial_price: 10.0,
            created_at: ts(0),
            last_checked_at: None,
            price_history: vec![],
            is_active: true,
        }
    }

    #[test]
    fn history_evicts_oldest_first() {
        let mut item = item();
        for i in 0..5 {
            item.push_history(10.0 + f64::from(i), ts(i), 3);
        }
        let prices: Vec<f64> = item.price_history.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![12.0, 13.0, 14.0]);
    }

    #[test]
    fn history_timestamps_never_go_backwards() {
        let mut item = item();
        item.push_history(10.0, ts(10), 10);
        item.push_history(9.0, ts(10) - Duration::minutes(5), 10);
        assert_eq!(item.price_history[1].timestamp, ts(10));
        assert_eq!(item.price_history[1].price, 9.0);
    }

    #[test]
    fn id_is_stable_per_url() {
        assert_eq!(
            TrackedItem::id_for_url("https://a.example/x"),
            TrackedItem::id_for_url("https://a.example/x")
        );
        assert_ne!(
            TrackedItem::id_for_url("https://a.example/x"),
            TrackedItem::id_for_url("https://a.example/y")
        );
    }

    #[test]
    fn config_missing_fields_take_defaults() {
        let config =
            ExtensionConfig::from_json_value(serde_json::json!({"price_drop_threshold_percent": 10.0}))
                .unwrap();
        assert_eq!(config.price_drop_threshold_percent, 10.0);
        assert_eq!(config.max_history_entries, 100);
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let (config, err) = ExtensionConfig::from_json_value_or_default(Some(
            serde_json::json!({"max_history_entries": "lots"}),
        ));
        assert_eq!(config, ExtensionConfig::default());
        assert!(matches!(err, Some(ConfigError::Malformed(_))));

        let (config, err) = ExtensionConfig::from_json_value_or_default(Some(
            serde_json::json!({"price_drop_threshold_percent": 250.0}),
        ));
        assert_eq!(config, ExtensionConfig::default());
        assert!(matches!(err, Some(ConfigError::Invalid { .. })));
    }

    #[test]
    fn check_interval_is_bounded() {
        let (config, err) = ExtensionConfig::from_json_value_or_default(Some(
            serde_json::json!({"check_interval_minutes": u64::MAX}),
        ));
        assert_eq!(config.check_interval_minutes, 360);
        assert!(matches!(
            err,
            Some(ConfigError::Invalid { field: "check_interval_minutes", .. })
        ));
    }

    #[test]
    fn tier_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&SupportTier::Whitelist).unwrap(), "\"whitelist\"");
        assert_eq!(SupportTier::None.to_string(), "none");
    }
}

//! Per-domain failure backoff. Pure state; persistence is the caller's job.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use pricewatch_adapters::normalize_host;
use pricewatch_core::RateLimitBucket;
use uuid::Uuid;

/// Wait applied after the Nth consecutive failure, capped at the last level.
pub const BACKOFF_MINUTES: [i64; 4] = [1, 5, 30, 120];

pub fn backoff_minutes(level: usize) -> i64 {
    BACKOFF_MINUTES[level.min(BACKOFF_MINUTES.len() - 1)]
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: BTreeMap<String, RateLimitBucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buckets(buckets: impl IntoIterator<Item = RateLimitBucket>) -> Self {
        Self {
            buckets: buckets
                .into_iter()
                .map(|bucket| (normalize_host(&bucket.domain), bucket))
                .collect(),
        }
    }

    pub fn is_allowed(&self, domain: &str) -> bool {
        self.is_allowed_at(domain, Utc::now())
    }

    pub fn is_allowed_at(&self, domain: &str, now: DateTime<Utc>) -> bool {
        self.bucket(domain)
            .map_or(true, |bucket| now >= bucket.next_retry_at)
    }

    /// Drops the domain's bucket. Returns whether one existed.
    pub fn record_success(&mut self, domain: &str) -> bool {
        self.buckets.remove(&normalize_host(domain)).is_some()
    }

    pub fn record_failure(&mut self, domain: &str, reason: &str) -> &RateLimitBucket {
        self.record_failure_at(domain, reason, Utc::now())
    }

    pub fn record_failure_at(
        &mut self,
        domain: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> &RateLimitBucket {
        self.record_failure_for(domain, reason, Uuid::new_v4(), now)
    }

    /// A second signal carrying the same `evaluation` id leaves the bucket as is.
    pub fn record_failure_for(
        &mut self,
        domain: &str,
        reason: &str,
        evaluation: Uuid,
        now: DateTime<Utc>,
    ) -> &RateLimitBucket {
        let key = normalize_host(domain);
        match self.buckets.entry(key) {
            Entry::Occupied(entry) => {
                let bucket = entry.into_mut();
                if bucket.last_evaluation == Some(evaluation) {
                    return bucket;
                }
                bucket.failure_count = bucket.failure_count.saturating_add(1);
                bucket.backoff_level = (bucket.backoff_level + 1).min(BACKOFF_MINUTES.len() - 1);
                let next = now + Duration::minutes(backoff_minutes(bucket.backoff_level));
                bucket.next_retry_at = bucket.next_retry_at.max(next);
                bucket.last_failure_reason = Some(reason.to_string());
                bucket.last_failure_at = Some(now);
                bucket.last_evaluation = Some(evaluation);
                bucket
            }
            Entry::Vacant(entry) => {
                let domain = entry.key().clone();
                entry.insert(RateLimitBucket {
                    domain,
                    failure_count: 1,
                    backoff_level: 0,
                    next_retry_at: now + Duration::minutes(backoff_minutes(0)),
                    last_failure_reason: Some(reason.to_string()),
                    last_failure_at: Some(now),
                    last_evaluation: Some(evaluation),
                })
            }
        }
    }

    pub fn minutes_until_retry(&self, domain: &str) -> i64 {
        self.minutes_until_retry_at(domain, Utc::now())
    }

    /// Whole minutes, rounded up; zero once the domain is allowed.
    pub fn minutes_until_retry_at(&self, domain: &str, now: DateTime<Utc>) -> i64 {
        let Some(bucket) = self.bucket(domain) else {
            return 0;
        };
        let remaining_ms = (bucket.next_retry_at - now).num_milliseconds();
        if remaining_ms <= 0 {
            0
        } else {
            (remaining_ms + 59_999) / 60_000
        }
    }

    pub fn bucket(&self, domain: &str) -> Option<&RateLimitBucket> {
        self.buckets.get(&normalize_host(domain))
    }

    pub fn buckets(&self) -> impl Iterator<Item = &RateLimitBucket> {
        self.buckets.values()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

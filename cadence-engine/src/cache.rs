//! Process-local query cache.
//!
//! Keys are structured (organization id + method + canonical options
//! fingerprint) and an organization-to-keys index backs invalidation, so
//! organizations with similar ids can never collide the way substring
//! matching would allow. Entries expire by TTL or by explicit
//! organization-scoped invalidation after a write; there is no cross-process
//! coherence.

use std::collections::{HashMap, HashSet};

use cadence_core::{OrganizationId, Timestamp};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

/// Analytics query methods, used as the middle key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryMethod {
    PulseMetrics,
    ShoutoutMetrics,
    CheckinCompliance,
    ReviewCompliance,
}

impl QueryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::PulseMetrics => "pulse_metrics",
            QueryMethod::ShoutoutMetrics => "shoutout_metrics",
            QueryMethod::CheckinCompliance => "checkin_compliance",
            QueryMethod::ReviewCompliance => "review_compliance",
        }
    }
}

/// Structured cache key.
///
/// The fingerprint is the JSON serialization of the query options;
/// serde_json orders map keys deterministically, so semantically identical
/// options collide on the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub organization_id: OrganizationId,
    pub method: QueryMethod,
    pub fingerprint: String,
}

impl QueryKey {
    pub fn new<T: Serialize>(
        organization_id: OrganizationId,
        method: QueryMethod,
        options: &T,
    ) -> Self {
        // Serializing plain option structs cannot fail; an empty fingerprint
        // still keys by organization and method.
        let fingerprint = serde_json::to_value(options)
            .map(|value| value.to_string())
            .unwrap_or_default();
        Self {
            organization_id,
            method,
            fingerprint,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Timestamp,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<QueryKey, CacheEntry>,
    by_organization: HashMap<OrganizationId, HashSet<QueryKey>>,
}

/// TTL cache for query results, keyed by [`QueryKey`].
#[derive(Debug, Default)]
pub struct QueryCache {
    state: RwLock<CacheState>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a live entry; expired entries count as misses.
    pub async fn get(&self, key: &QueryKey) -> Option<serde_json::Value> {
        let state = self.state.read().await;
        state
            .entries
            .get(key)
            .filter(|entry| Utc::now() < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    /// Store a value with the given TTL.
    pub async fn put(&self, key: QueryKey, value: serde_json::Value, ttl: std::time::Duration) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.write().await;
        state
            .by_organization
            .entry(key.organization_id)
            .or_default()
            .insert(key.clone());
        state.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Drop every entry for an organization. Coarse but safe: any write that
    /// can change an organization's analytics answer invalidates all of its
    /// entries, regardless of method or options.
    pub async fn invalidate_organization(&self, organization_id: OrganizationId) -> usize {
        let mut state = self.state.write().await;
        let keys = match state.by_organization.remove(&organization_id) {
            Some(keys) => keys,
            None => return 0,
        };
        let mut removed = 0;
        for key in keys {
            if state.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove expired entries. Housekeeping only; `get` already treats them
    /// as misses.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let expired: Vec<QueryKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
            if let Some(keys) = state.by_organization.get_mut(&key.organization_id) {
                keys.remove(key);
                if keys.is_empty() {
                    state.by_organization.remove(&key.organization_id);
                }
            }
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}

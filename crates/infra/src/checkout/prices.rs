//! TTL cache in front of the provider's price catalog.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use signpost_core::Clock;

use crate::external::{ExternalError, PriceCatalog};

#[derive(Debug, Clone)]
struct Entry {
    price_id: Option<String>,
    fetched_at: DateTime<Utc>,
}

/// Process-local price lookups, constructed once at startup and injected.
///
/// Misses (unknown lookup keys) are cached too; provider errors are not.
pub struct PriceCache {
    catalog: Arc<dyn PriceCatalog>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl std::fmt::Debug for PriceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl PriceCache {
    pub fn new(catalog: Arc<dyn PriceCatalog>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            catalog,
            clock,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn price_id(&self, lookup_key: &str) -> Result<Option<String>, ExternalError> {
        let now = self.clock.now();
        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(lookup_key) {
                if now - entry.fetched_at < self.ttl {
                    return Ok(entry.price_id.clone());
                }
            }
        }

        let price_id = self.catalog.lookup_price(lookup_key).await?;
        debug!(lookup_key, price_id = ?price_id, "price lookup refreshed");
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                lookup_key.to_string(),
                Entry {
                    price_id: price_id.clone(),
                    fetched_at: now,
                },
            );
        }
        Ok(price_id)
    }

    pub fn invalidate(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use signpost_core::ManualClock;

    use crate::external::fakes::FakePayments;

    #[tokio::test]
    async fn lookups_are_cached_until_ttl() {
        let catalog = Arc::new(FakePayments::default());
        catalog
            .prices
            .lock()
            .unwrap()
            .insert("sign_18x24".into(), "price_1".into());
        let clock = ManualClock::arc(Utc::now());
        let cache = PriceCache::new(catalog.clone(), clock.clone(), Duration::hours(1));

        assert_eq!(cache.price_id("sign_18x24").await.unwrap().as_deref(), Some("price_1"));
        assert_eq!(cache.price_id("sign_18x24").await.unwrap().as_deref(), Some("price_1"));
        assert_eq!(catalog.price_lookups.load(Ordering::SeqCst), 1);

        clock.advance(Duration::minutes(61));
        cache.price_id("sign_18x24").await.unwrap();
        assert_eq!(catalog.price_lookups.load(Ordering::SeqCst), 2);

        cache.invalidate();
        assert!(cache.price_id("unknown").await.unwrap().is_none());
        cache.price_id("sign_18x24").await.unwrap();
        assert_eq!(catalog.price_lookups.load(Ordering::SeqCst), 4);
    }
}

use std::time::Duration;

use moka::future::Cache;

/// Delivery IDs seen recently, bounded in size and age.
/// GitHub reuses the delivery ID when a delivery is redelivered.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLog {
    seen: Option<Cache<String, ()>>,
}

impl DeliveryLog {
    /// A capacity of 0 remembers nothing, every delivery is processed.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let seen = (capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        Self { seen }
    }

    /// Record `delivery_id`, returning false if it was already recorded.
    pub async fn first_seen(&self, delivery_id: &str) -> bool {
        let Some(seen) = &self.seen else {
            return true;
        };
        seen.entry_by_ref(delivery_id)
            .or_insert(())
            .await
            .is_fresh()
    }

    /// Forget `delivery_id` so that a redelivery is processed again, e.g. after a failure.
    pub async fn forget(&self, delivery_id: &str) {
        if let Some(seen) = &self.seen {
            seen.invalidate(delivery_id).await;
        }
    }
}

//! Temporary block list
//!
//! Block entries live only in the shared store; their lifetime is exactly
//! their TTL. Re-adding a blocked IP appends the reason, bumps the
//! recidivism count and doubles the TTL, bounded by the configured maximum.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::error::GuardResult;
use crate::store::{keys, Store};
use crate::IpEntry;

pub struct BlockList {
    store: Arc<dyn Store>,
    min_ttl: Duration,
    max_ttl: Duration,
}

impl BlockList {
    pub fn new(store: Arc<dyn Store>, min_ttl: Duration, max_ttl: Duration) -> Self {
        Self {
            store,
            min_ttl,
            max_ttl,
        }
    }

    /// Whether an IP currently holds a live block entry. Store errors read
    /// as not-blocked; the next request self-corrects.
    pub async fn is_blocked(&self, ip: &str) -> bool {
        match self.store.exists(&keys::block(ip)).await {
            Ok(blocked) => blocked,
            Err(err) => {
                warn!("block lookup for {} failed: {}", ip, err);
                false
            }
        }
    }

    async fn entry(&self, ip: &str) -> GuardResult<Option<IpEntry>> {
        match self.store.get(&keys::block(ip)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Create or escalate a block entry.
    ///
    /// The count is strictly monotonic; the TTL follows
    /// `min(max_ttl, min_ttl * 2^count)` on every write.
    pub async fn add(&self, ip: &str, reason: &str) -> GuardResult<()> {
        let now = Utc::now().timestamp();

        let entry = match self.entry(ip).await? {
            Some(mut entry) => {
                entry.reason.push('\n');
                entry.reason.push_str(reason);
                entry.count = Some(entry.count.unwrap_or(0) + 1);
                entry.last = Some(now);
                entry
            }
            None => IpEntry {
                ip: ip.to_string(),
                reason: reason.to_string(),
                added_at: now,
                count: Some(1),
                last: Some(now),
            },
        };

        let ttl = self.ttl_for(entry.count.unwrap_or(1));
        let json = serde_json::to_string(&entry)?;
        self.store.set(&keys::block(ip), &json, Some(ttl)).await?;

        Ok(())
    }

    fn ttl_for(&self, count: i64) -> Duration {
        let factor = 1u64 << count.clamp(1, 62) as u32;
        let secs = self.min_ttl.as_secs().saturating_mul(factor);
        Duration::from_secs(secs.min(self.max_ttl.as_secs()))
    }
}

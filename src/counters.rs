//! Sliding-window counters
//!
//! Best-effort counters in the shared store: per-minute request frequency,
//! per-hour block recurrence, and the session-scoped 404 / login-failure
//! tallies fed by the public hooks. TTLs are armed on the first increment of
//! each window.

use std::time::Duration;

use chrono::Utc;

use crate::error::GuardResult;
use crate::store::{keys, Store};

const FREQUENCY_TTL: Duration = Duration::from_secs(120);
const HOUR_TTL: Duration = Duration::from_secs(3600);

/// Requests seen from an IP in the current minute bucket.
pub async fn request_count_in_minute(store: &dyn Store, ip: &str) -> GuardResult<i64> {
    let bucket = Utc::now().timestamp() / 60;
    let key = keys::frequency(ip, bucket);

    let count = store.incr(&key).await?;
    if count == 1 {
        store.expire(&key, FREQUENCY_TTL).await?;
    }
    Ok(count)
}

/// Times a blocked IP has kept requesting within the current hour. Only
/// called for IPs already on the block list.
pub async fn block_recurrence(store: &dyn Store, ip: &str) -> GuardResult<i64> {
    let key = keys::block_count(ip);

    let count = store.incr(&key).await?;
    if count == 1 {
        store.expire(&key, HOUR_TTL).await?;
    }
    Ok(count)
}

/// Record a 404 response for a session.
pub async fn record_not_found(store: &dyn Store, session_id: &str) -> GuardResult<i64> {
    bump_hourly(store, &keys::not_found_404(session_id)).await
}

/// Record a failed login for a session.
pub async fn record_login_failure(store: &dyn Store, session_id: &str) -> GuardResult<i64> {
    bump_hourly(store, &keys::login_failure(session_id)).await
}

async fn bump_hourly(store: &dyn Store, key: &str) -> GuardResult<i64> {
    let count = store.incr(key).await?;
    if count == 1 {
        store.expire(key, HOUR_TTL).await?;
    }
    Ok(count)
}

/// Read a counter without touching it; a missing key reads as zero.
pub async fn read(store: &dyn Store, key: &str) -> GuardResult<i64> {
    Ok(store
        .get(key)
        .await?
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_request_count_increments_within_bucket() {
        let store = MemoryStore::new();
        assert_eq!(request_count_in_minute(&store, "1.2.3.4").await.unwrap(), 1);
        assert_eq!(request_count_in_minute(&store, "1.2.3.4").await.unwrap(), 2);
        // another IP has its own bucket
        assert_eq!(request_count_in_minute(&store, "5.6.7.8").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_hooks_accumulate_per_session() {
        let store = MemoryStore::new();
        record_not_found(&store, "sid").await.unwrap();
        record_not_found(&store, "sid").await.unwrap();
        record_login_failure(&store, "sid").await.unwrap();

        assert_eq!(read(&store, &keys::not_found_404("sid")).await.unwrap(), 2);
        assert_eq!(read(&store, &keys::login_failure("sid")).await.unwrap(), 1);
        assert_eq!(read(&store, &keys::not_found_404("other")).await.unwrap(), 0);
    }
}

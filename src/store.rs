//! Shared store access
//!
//! All cross-request state lives in a Redis-compatible key-value store. The
//! [`Store`] trait captures exactly the primitive set the engine needs so the
//! rest of the crate never touches a raw client. [`RedisStore`] is the
//! production implementation; [`MemoryStore`] keeps the same semantics in
//! process for tests and single-node deployments.
//!
//! The store is authoritative. In-memory caches elsewhere in the crate are
//! optimizations only and must not be relied on for denial decisions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use crate::config::StoreConfig;
use crate::error::GuardResult;

/// Key-schema constructors. TTLs are listed next to the operations using the
/// keys; the schema itself is flat strings.
pub mod keys {
    pub fn trust(ip: &str) -> String {
        format!("allow:{ip}")
    }

    pub fn deny(ip: &str) -> String {
        format!("deny:{ip}")
    }

    pub fn block(ip: &str) -> String {
        format!("block:{ip}")
    }

    pub fn block_count(ip: &str) -> String {
        format!("block:count:{ip}")
    }

    pub fn frequency(ip: &str, minute_bucket: i64) -> String {
        format!("frequency:{ip}:{minute_bucket}")
    }

    pub fn session_ip(session_id: &str) -> String {
        format!("session:ip:{session_id}")
    }

    pub fn ip_device(ip: &str) -> String {
        format!("ip:device:{ip}")
    }

    pub fn device_fp(fingerprint: &str) -> String {
        format!("device:fp:{fingerprint}")
    }

    pub fn fp_session(minute: i64, fingerprint: &str) -> String {
        format!("fp:session:{minute}:{fingerprint}")
    }

    pub fn interval_last(session_id: &str) -> String {
        format!("interval:last:{session_id}")
    }

    pub fn interval(session_id: &str) -> String {
        format!("interval:{session_id}")
    }

    pub fn session_start(session_id: &str) -> String {
        format!("session:start:{session_id}")
    }

    pub fn geo_ip(ip: &str) -> String {
        format!("geo:ip:{ip}")
    }

    pub fn geo_locations(session_id: &str) -> String {
        format!("geo:locations:{session_id}")
    }

    pub fn not_found_404(session_id: &str) -> String {
        format!("notfound:404:{session_id}")
    }

    pub fn login_failure(session_id: &str) -> String {
        format!("login:failure:{session_id}")
    }
}

/// The store primitives the decision engine relies on.
///
/// The compound operations (`sadd_card`, `lpush_trim`) are pipelined on the
/// Redis side so a request observes its own write in the returned
/// cardinality or list, matching the ordering model the scorer expects.
#[async_trait]
pub trait Store: Send + Sync {
    /// `GET key`
    async fn get(&self, key: &str) -> GuardResult<Option<String>>;

    /// Pipelined `GET` of several keys, values in key order.
    async fn get_many(&self, keys: &[String]) -> GuardResult<Vec<Option<String>>>;

    /// `SET key value` / `SETEX key ttl value`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GuardResult<()>;

    /// `EXISTS key`
    async fn exists(&self, key: &str) -> GuardResult<bool>;

    /// `INCR key`
    async fn incr(&self, key: &str) -> GuardResult<i64>;

    /// `EXPIRE key ttl`
    async fn expire(&self, key: &str, ttl: Duration) -> GuardResult<()>;

    /// Pipelined `SADD key member; EXPIRE key ttl; SCARD key`, returning the
    /// post-add cardinality.
    async fn sadd_card(&self, key: &str, member: &str, ttl: Duration) -> GuardResult<i64>;

    /// Pipelined `LPUSH key value; LTRIM key 0 cap-1; EXPIRE key ttl;
    /// LRANGE key 0 -1`, returning the trimmed list (newest first).
    async fn lpush_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> GuardResult<Vec<String>>;

    /// Pipelined `SET` of many persistent keys (list snapshot loading).
    async fn set_many(&self, entries: &[(String, String)]) -> GuardResult<()>;
}

// =============================================================================
// Redis
// =============================================================================

/// Redis-backed store using a shared connection manager.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect and ping. Fails fast when the store is unreachable.
    pub async fn connect(config: &StoreConfig) -> GuardResult<Self> {
        let client = redis::Client::open(config.url())?;
        let mut conn = redis::aio::ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> GuardResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn get_many(&self, keys: &[String]) -> GuardResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GuardResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> GuardResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn incr(&self, key: &str) -> GuardResult<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1i64).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GuardResult<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn sadd_card(&self, key: &str, member: &str, ttl: Duration) -> GuardResult<i64> {
        let mut conn = self.conn.clone();
        let (card,): (i64,) = redis::pipe()
            .sadd(key, member)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .scard(key)
            .query_async(&mut conn)
            .await?;
        Ok(card)
    }

    async fn lpush_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> GuardResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, cap as isize - 1)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .lrange(key, 0, -1)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn set_many(&self, entries: &[(String, String)]) -> GuardResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

enum Slot {
    Text(String),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

/// In-process store with the same expiry semantics as Redis.
///
/// Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(map: &mut HashMap<String, Entry>, key: &str, slot: Slot, ttl: Option<Duration>) {
        map.insert(
            key.to_string(),
            Entry {
                slot,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn purge(map: &mut HashMap<String, Entry>, key: &str) {
        if map.get(key).is_some_and(|e| !e.live()) {
            map.remove(key);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> GuardResult<Option<String>> {
        let mut map = self.entries.lock();
        Self::purge(&mut map, key);
        Ok(match map.get(key).map(|e| &e.slot) {
            Some(Slot::Text(value)) => Some(value.clone()),
            _ => None,
        })
    }

    async fn get_many(&self, keys: &[String]) -> GuardResult<Vec<Option<String>>> {
        let mut map = self.entries.lock();
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            Self::purge(&mut map, key);
            values.push(match map.get(key.as_str()).map(|e| &e.slot) {
                Some(Slot::Text(value)) => Some(value.clone()),
                _ => None,
            });
        }
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GuardResult<()> {
        let mut map = self.entries.lock();
        Self::insert(&mut map, key, Slot::Text(value.to_string()), ttl);
        Ok(())
    }

    async fn exists(&self, key: &str) -> GuardResult<bool> {
        let mut map = self.entries.lock();
        Self::purge(&mut map, key);
        Ok(map.contains_key(key))
    }

    async fn incr(&self, key: &str) -> GuardResult<i64> {
        let mut map = self.entries.lock();
        Self::purge(&mut map, key);
        let next = match map.get(key).map(|e| &e.slot) {
            Some(Slot::Text(value)) => value.parse::<i64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> GuardResult<()> {
        let mut map = self.entries.lock();
        Self::purge(&mut map, key);
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn sadd_card(&self, key: &str, member: &str, ttl: Duration) -> GuardResult<i64> {
        let mut map = self.entries.lock();
        Self::purge(&mut map, key);
        if !matches!(map.get(key).map(|e| &e.slot), Some(Slot::Set(_))) {
            Self::insert(&mut map, key, Slot::Set(HashSet::new()), Some(ttl));
        }
        match map.get_mut(key) {
            Some(Entry {
                slot: Slot::Set(set),
                expires_at,
            }) => {
                set.insert(member.to_string());
                *expires_at = Some(Instant::now() + ttl);
                Ok(set.len() as i64)
            }
            _ => unreachable!("set slot just ensured"),
        }
    }

    async fn lpush_trim(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> GuardResult<Vec<String>> {
        let mut map = self.entries.lock();
        Self::purge(&mut map, key);
        if !matches!(map.get(key).map(|e| &e.slot), Some(Slot::List(_))) {
            Self::insert(&mut map, key, Slot::List(VecDeque::new()), Some(ttl));
        }
        match map.get_mut(key) {
            Some(Entry {
                slot: Slot::List(list),
                expires_at,
            }) => {
                *expires_at = Some(Instant::now() + ttl);
                list.push_front(value.to_string());
                list.truncate(cap);
                Ok(list.iter().cloned().collect())
            }
            _ => unreachable!("list slot just ensured"),
        }
    }

    async fn set_many(&self, entries: &[(String, String)]) -> GuardResult<()> {
        let mut map = self.entries.lock();
        for (key, value) in entries {
            Self::insert(&mut map, key, Slot::Text(value.clone()), None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_incr_and_get() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("counter").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 2);
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let store = MemoryStore::new();
        store
            .set("short", "x", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(store.exists("short").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.exists("short").await.unwrap());
        assert_eq!(store.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_get_many_preserves_key_order() {
        let store = MemoryStore::new();
        store.set("a", "1", None).await.unwrap();
        store.set("c", "3", None).await.unwrap();

        let values = store
            .get_many(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_memory_sadd_card_counts_distinct_members() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.sadd_card("s", "a", ttl).await.unwrap(), 1);
        assert_eq!(store.sadd_card("s", "a", ttl).await.unwrap(), 1);
        assert_eq!(store.sadd_card("s", "b", ttl).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_lpush_trim_caps_and_orders() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        for i in 0..12 {
            store
                .lpush_trim("l", &i.to_string(), 10, ttl)
                .await
                .unwrap();
        }
        let items = store.lpush_trim("l", "12", 10, ttl).await.unwrap();
        assert_eq!(items.len(), 10);
        // newest first
        assert_eq!(items[0], "12");
        assert_eq!(items[1], "11");
    }

    #[test]
    fn test_key_schema() {
        assert_eq!(keys::trust("1.2.3.4"), "allow:1.2.3.4");
        assert_eq!(keys::block_count("1.2.3.4"), "block:count:1.2.3.4");
        assert_eq!(keys::frequency("1.2.3.4", 99), "frequency:1.2.3.4:99");
        assert_eq!(keys::fp_session(7, "ab"), "fp:session:7:ab");
    }
}

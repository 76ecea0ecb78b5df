//! Key -> list stores used by [`RemoteStorage`](super::RemoteStorage).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{Result, StorageError};

/// The subset of a key-value store the remote backend needs: string lists
/// addressed by key, key expiry, and glob-style key scans.
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Prepend `value` to the list at `key`, creating it if absent.
    async fn push_front(&self, key: &str, value: String) -> Result<()>;

    /// Reset the time-to-live of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// All keys matching the Redis glob `pattern`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// The full list at `key`, head first. Missing keys yield an empty list.
    async fn range_all(&self, key: &str) -> Result<Vec<String>>;
}

/// Redis-backed list store (LPUSH / EXPIRE / SCAN / LRANGE).
#[derive(Clone)]
pub struct RedisListStore {
    conn: ConnectionManager,
}

impl RedisListStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let mut conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(unavailable)?;
        info!("Connected to redis");
        Ok(Self { conn })
    }

    /// Builds a `redis://` URL from the `host:port` address form used in configuration.
    pub fn url(addr: &str, password: Option<&str>, db: i64) -> String {
        match password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}/{}", password, addr, db)
            }
            _ => format!("redis://{}/{}", addr, db),
        }
    }
}

fn unavailable(err: redis::RedisError) -> StorageError {
    StorageError::BackendUnavailable(err.to_string())
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn push_front(&self, key: &str, value: String) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn range_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(unavailable)
    }
}

#[derive(Debug)]
struct ListEntry {
    values: VecDeque<String>,
    expires_at: Option<Instant>,
}

impl ListEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process list store with the same key, list, expiry and `SCAN MATCH`
/// glob semantics as Redis.
///
/// `set_available(false)` makes every call fail with
/// [`StorageError::BackendUnavailable`].
#[derive(Debug)]
pub struct MemoryListStore {
    lists: DashMap<String, ListEntry>,
    available: AtomicBool,
}

impl Default for MemoryListStore {
    fn default() -> Self {
        Self {
            lists: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining time-to-live of `key`, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lists
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable(
                "list store marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn push_front(&self, key: &str, value: String) -> Result<()> {
        self.check()?;
        let now = Instant::now();
        let mut entry = self.lists.entry(key.to_string()).or_insert_with(|| ListEntry {
            values: VecDeque::new(),
            expires_at: None,
        });
        if !entry.is_live(now) {
            entry.values.clear();
            entry.expires_at = None;
        }
        entry.values.push_front(value);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        if let Some(mut entry) = self.lists.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lists
            .iter()
            .filter(|entry| entry.is_live(now) && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn range_all(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lists
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.values.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Redis `KEYS`/`SCAN MATCH` glob: `*`, `?`, `[...]` classes (with `^`
/// negation and `a-z` ranges) and `\` escapes. Matching is byte-wise.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn match_bytes(mut p: &[u8], mut t: &[u8]) -> bool {
    while let Some(&pc) = p.first() {
        match pc {
            b'*' => {
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                return (0..=t.len()).any(|i| match_bytes(p, &t[i..]));
            }
            b'?' => {
                if t.is_empty() {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
            b'[' => {
                let Some((&c, rest)) = t.split_first() else {
                    return false;
                };
                let (matched, after) = match_class(&p[1..], c);
                if !matched {
                    return false;
                }
                p = after;
                t = rest;
            }
            b'\\' if p.len() >= 2 => {
                if t.first() != Some(&p[1]) {
                    return false;
                }
                p = &p[2..];
                t = &t[1..];
            }
            _ => {
                if t.first() != Some(&pc) {
                    return false;
                }
                p = &p[1..];
                t = &t[1..];
            }
        }
    }
    t.is_empty()
}

/// Matches `c` against a class body (the bytes after `[`). Returns the
/// result and the pattern following the closing `]`; an unterminated class
/// runs to the end of the pattern.
fn match_class(mut class: &[u8], c: u8) -> (bool, &[u8]) {
    let negate = class.first() == Some(&b'^');
    if negate {
        class = &class[1..];
    }
    let mut matched = false;
    loop {
        match class {
            [] => return (matched != negate, class),
            [b']', rest @ ..] => return (matched != negate, rest),
            [b'\\', escaped, rest @ ..] => {
                matched |= *escaped == c;
                class = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                matched |= (lo..=hi).contains(&c);
                class = rest;
            }
            [other, rest @ ..] => {
                matched |= *other == c;
                class = rest;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("events:*", "events:u:click"));
        assert!(glob_match("events:u:*", "events:u:click"));
        assert!(glob_match("events:*:click", "events:u:click"));
        assert!(glob_match("events:*:click", "events:a:b:click"));
        assert!(!glob_match("events:*:click", "events:u:view"));
        assert!(!glob_match("events:u:*", "events:uu:click"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn glob_metacharacters_follow_redis() {
        // unescaped brackets form a class, so the literal key is missed
        assert!(glob_match("events:u[1]:*", "events:u1:click"));
        assert!(!glob_match("events:u[1]:*", "events:u[1]:click"));

        assert!(glob_match(r"events:u\[1\]:*", "events:u[1]:click"));
        assert!(!glob_match(r"events:u\[1\]:*", "events:u1:click"));
        assert!(glob_match(r"a\*b", "a*b"));
        assert!(!glob_match(r"a\*b", "axb"));
        assert!(glob_match(r"a\\b", r"a\b"));

        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(glob_match("h[a-c]llo", "hbllo"));
        assert!(!glob_match("h[a-c]llo", "hdllo"));
    }

    #[test]
    fn redis_url_forms() {
        assert_eq!(RedisListStore::url("localhost:6379", None, 0), "redis://localhost:6379/0");
        assert_eq!(
            RedisListStore::url("cache:6380", Some("secret"), 2),
            "redis://:secret@cache:6380/2"
        );
        assert_eq!(RedisListStore::url("cache:6380", Some(""), 1), "redis://cache:6380/1");
    }

    #[tokio::test]
    async fn lists_are_head_first() {
        let store = MemoryListStore::new();
        store.push_front("k", "first".into()).await.unwrap();
        store.push_front("k", "second".into()).await.unwrap();
        assert_eq!(store.range_all("k").await.unwrap(), vec!["second", "first"]);
        assert!(store.range_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_keys_disappear() {
        let store = MemoryListStore::new();
        store.push_front("k", "v".into()).await.unwrap();
        store.expire("k", Duration::ZERO).await.unwrap();

        assert!(store.range_all("k").await.unwrap().is_empty());
        assert!(store.scan_keys("*").await.unwrap().is_empty());

        store.push_front("k", "fresh".into()).await.unwrap();
        assert_eq!(store.range_all("k").await.unwrap(), vec!["fresh"]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryListStore::new();
        store.set_available(false);
        assert!(matches!(
            store.push_front("k", "v".into()).await,
            Err(StorageError::BackendUnavailable(_))
        ));
        assert!(store.scan_keys("*").await.is_err());
        assert!(store.range_all("k").await.is_err());
    }
}

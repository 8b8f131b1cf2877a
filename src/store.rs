use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("system clock is set before the unix epoch")]
    Clock,
}

/// Source of wall clock time, in milliseconds since the unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> Result<u64, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Result<u64, Error> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Clock)?;
        Ok(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Result<u64, Error> {
        Ok(self.now.load(Ordering::SeqCst))
    }
}

/// Decides whether a write goes through depending on whether the key currently holds a live
/// value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteMode {
    #[default]
    Upsert,
    OnlyIfAbsent,
    OnlyIfPresent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetStatus {
    Written,
    NotWritten,
}

type Key = String;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub data: Bytes,
    /// Milliseconds since the unix epoch at the time of the write.
    pub created_at: u64,
    /// Time to live in milliseconds, relative to `created_at`.
    pub ttl: Option<u64>,
}

impl Value {
    fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            // A clock that went backwards counts as no time elapsed.
            Some(ttl) => now.saturating_sub(self.created_at) >= ttl,
            None => false,
        }
    }
}

/// The Store holds every key of the server and is shared, through cheap clones, by all the
/// connections.
///
/// Keys are spread over the shards of a [`DashMap`], so operations on different keys rarely
/// contend and never wait on a global lock. Each operation on a key runs under its shard lock,
/// which makes it atomic with respect to any other operation on that key. Keys with a TTL are
/// evicted lazily, the first time an operation observes them expired.
#[derive(Clone)]
pub struct Store {
    inner: Arc<InnerStore>,
}

pub struct InnerStore {
    keys: DashMap<Key, Value>,
    clock: Box<dyn Clock>,
}

impl Store {
    pub fn new() -> Store {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock) -> Store {
        let inner = InnerStore {
            keys: DashMap::new(),
            clock: Box::new(clock),
        };

        Self {
            inner: Arc::new(inner),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Store {
    type Target = InnerStore;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("keys", &self.keys.len()).finish()
    }
}

impl InnerStore {
    /// Writes `data` under `key` if `mode` allows it given the live value, if any, currently
    /// stored there. The check and the write happen in one step.
    pub fn set(
        &self,
        key: Key,
        data: Bytes,
        ttl: Option<u64>,
        mode: WriteMode,
    ) -> Result<SetStatus, Error> {
        let now = self.clock.now_millis()?;
        let value = Value {
            data,
            created_at: now,
            ttl,
        };

        let status = match self.keys.entry(key) {
            Entry::Occupied(mut entry) => {
                let live = !entry.get().is_expired(now);
                match (mode, live) {
                    (WriteMode::OnlyIfAbsent, true) => SetStatus::NotWritten,
                    (WriteMode::OnlyIfPresent, false) => {
                        entry.remove();
                        SetStatus::NotWritten
                    }
                    _ => {
                        entry.insert(value);
                        SetStatus::Written
                    }
                }
            }
            Entry::Vacant(entry) => match mode {
                WriteMode::OnlyIfPresent => SetStatus::NotWritten,
                WriteMode::Upsert | WriteMode::OnlyIfAbsent => {
                    entry.insert(value);
                    SetStatus::Written
                }
            },
        };

        Ok(status)
    }

    /// Returns the live value stored under `key`. An expired value is removed.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        let now = self.clock.now_millis()?;

        // The read guard must be gone before evicting, both live in the same shard.
        let data = match self.keys.get(key) {
            None => return Ok(None),
            Some(value) if value.is_expired(now) => None,
            Some(value) => Some(value.data.clone()),
        };

        if data.is_none() {
            // Re-checked under the write lock, a fresh value written meanwhile is kept.
            self.keys.remove_if(key, |_, value| value.is_expired(now));
        }

        Ok(data)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.keys.remove(key).map(|(_, value)| value)
    }

    /// Whether `key` has an entry, expired or not.
    pub fn contains_raw(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

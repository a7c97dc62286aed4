//! Response cache plugin
//!
//! Caches responses of read operations (operation types starting with `Get`,
//! `List`, `Retrieve` or `Fetch`) for a configurable duration. Caching is a
//! two-phase protocol driven by the calling service:
//!
//! 1. On a hit the plugin returns the `UseCachedValue`/`CachedValue`
//!    modifications and the service skips the real call.
//! 2. On a miss the plugin returns `ShouldCache = true` with a `CacheKey`;
//!    after the real call succeeds the service stores the response with
//!    [`CachePlugin::cache_response`].
//!
//! The table holds at most `MaxCacheSize` entries. Inserting a new key into a
//! full table first evicts the oldest entries by creation time. Expired
//! entries are never served and are removed by a periodic background sweep.
//!
//! Reads go through an immutable snapshot and never take a lock; inserts,
//! evictions, sweeps and clears are serialized by one mutex and publish a new
//! snapshot.

use super::{positive_count, positive_f64};
use crate::clock::{SharedClock, system_clock};
use crate::config::PluginConfiguration;
use crate::context::ExecutionContext;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{Plugin, PluginDescriptor, PluginState};
use crate::result::{ExecutionResult, keys};
use crate::value::Value;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default plugin id
pub const CACHE_PLUGIN_ID: &str = "cache";

const READ_OPERATION_PREFIXES: [&str; 4] = ["Get", "List", "Retrieve", "Fetch"];

/// Longest configurable `CacheDurationMinutes` (one year)
const MAX_CACHE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cache settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    /// Time-to-live of entries stored without an explicit duration
    /// (`CacheDurationMinutes`, default 15)
    pub cache_duration: Duration,
    /// Maximum number of entries (`MaxCacheSize`, default 1000)
    pub max_cache_size: usize,
    /// Period of the background expiry sweep (`CacheSweepIntervalSeconds`,
    /// default 60)
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_secs(15 * 60),
            max_cache_size: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheSettings {
    /// Read settings, keeping the default for missing, non-positive or
    /// out-of-range values
    pub fn from_configuration(config: &PluginConfiguration, plugin_id: &str) -> Self {
        let defaults = Self::default();
        let minutes = positive_f64(
            config,
            plugin_id,
            "CacheDurationMinutes",
            defaults.cache_duration.as_secs_f64() / 60.0,
        );
        let sweep_seconds = positive_f64(
            config,
            plugin_id,
            "CacheSweepIntervalSeconds",
            defaults.sweep_interval.as_secs_f64(),
        );

        let cache_duration = match Duration::try_from_secs_f64(minutes * 60.0) {
            Ok(duration) if duration <= MAX_CACHE_DURATION => duration,
            _ => {
                warn!(
                    plugin_id,
                    minutes,
                    max_minutes = MAX_CACHE_DURATION.as_secs() / 60,
                    "CacheDurationMinutes out of range, using default"
                );
                defaults.cache_duration
            }
        };

        Self {
            cache_duration,
            max_cache_size: positive_count(
                config,
                plugin_id,
                "MaxCacheSize",
                defaults.max_cache_size,
            ),
            sweep_interval: Duration::try_from_secs_f64(sweep_seconds)
                .unwrap_or(defaults.sweep_interval),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned a value
    pub hits: u64,
    /// Lookups that found nothing servable
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because they expired
    pub expirations: u64,
    /// Current entry count (expired but unswept entries included)
    pub current_entries: usize,
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// Insertion order; breaks ties between equal creation times
    sequence: u64,
}

impl CacheEntry {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

type Table = HashMap<String, Arc<CacheEntry>>;

/// Shared by the plugin and its sweep task
#[derive(Debug)]
struct CacheStore {
    clock: SharedClock,
    settings: RwLock<CacheSettings>,
    entries: ArcSwap<Table>,
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStore {
    fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            settings: RwLock::new(CacheSettings::default()),
            entries: ArcSwap::from_pointee(Table::new()),
            write_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let entries = self.entries.load();

        match entries.get(key) {
            Some(entry) if entry.is_valid_at(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn insert(&self, key: String, value: Value, ttl: TimeDelta) -> PluginResult<()> {
        let _write = self.write_lock.lock();
        let max_size = self.settings.read().max_cache_size;
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            PluginError::validation(format!(
                "Cache duration of {}s overflows the expiry timestamp",
                ttl.num_seconds()
            ))
        })?;

        let mut table = Table::clone(&self.entries.load());
        if !table.contains_key(&key) && table.len() >= max_size {
            let excess = table.len() - max_size + 1;
            self.evict_oldest(&mut table, excess);
        }

        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        table.insert(key, Arc::new(entry));
        self.entries.store(Arc::new(table));
        Ok(())
    }

    fn evict_oldest(&self, table: &mut Table, count: usize) {
        let mut by_age: Vec<(DateTime<Utc>, u64, String)> = table
            .iter()
            .map(|(key, entry)| (entry.created_at, entry.sequence, key.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, _, key) in by_age.into_iter().take(count) {
            trace!(key = %key, "Evicting cache entry");
            table.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sweep_expired(&self) -> usize {
        let _write = self.write_lock.lock();
        let now = self.clock.now();
        let current = self.entries.load_full();

        let table: Table = current
            .iter()
            .filter(|(_, entry)| entry.is_valid_at(now))
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let removed = current.len() - table.len();
        if removed > 0 {
            self.expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.entries.store(Arc::new(table));
        }
        removed
    }

    fn invalidate(&self, key: &str) -> bool {
        let _write = self.write_lock.lock();
        let current = self.entries.load_full();
        if !current.contains_key(key) {
            return false;
        }

        let mut table = Table::clone(&current);
        table.remove(key);
        self.entries.store(Arc::new(table));
        true
    }

    fn clear(&self) {
        let _write = self.write_lock.lock();
        self.entries.store(Arc::new(Table::new()));
    }
}

/// Caches responses of read operations
///
/// # Examples
///
/// ```rust,no_run
/// use clickup_plugins::{CachePlugin, PluginManager, PluginConfiguration};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = PluginManager::new();
/// let cache = Arc::new(CachePlugin::new());
/// let config = PluginConfiguration::builder()
///     .set("CacheDurationMinutes", 5)
///     .set("MaxCacheSize", 250)
///     .build();
///
/// manager
///     .register(cache.clone(), config, &CancellationToken::new())
///     .await?;
///
/// // after a miss and a successful call:
/// cache.cache_response("TaskService:GetTasks:00000000deadbeef", "[]", None)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CachePlugin {
    descriptor: PluginDescriptor,
    state: PluginState,
    store: Arc<CacheStore>,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl Default for CachePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CachePlugin {
    /// Create a cache plugin on the system clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a cache plugin reading time from `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            descriptor: PluginDescriptor::new(CACHE_PLUGIN_ID, "Response Cache", "1.0.0")
                .with_description("Caches responses of read operations with a bounded TTL table"),
            state: PluginState::new(),
            store: Arc::new(CacheStore::new(clock)),
            sweeper: Mutex::new(None),
        }
    }

    /// Use a different plugin id, e.g. to register two caches side by side
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.descriptor.id = id.into();
        self
    }

    /// Whether `operation_type` is cacheable
    pub fn is_read_operation(operation_type: &str) -> bool {
        READ_OPERATION_PREFIXES.iter().any(|prefix| {
            operation_type
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        })
    }

    /// Key under which the response for `context` is cached
    ///
    /// Composed of service name, operation type and a hash of the request
    /// data; independent of the order the request data was inserted in.
    /// `None` when the request data holds an opaque value, whose content
    /// cannot be hashed.
    pub fn cache_key(context: &ExecutionContext<'_>) -> Option<String> {
        if context
            .request_data
            .values()
            .any(|value| matches!(value, Value::Opaque(_)))
        {
            return None;
        }

        let mut pairs: Vec<(&str, String)> = context
            .request_data
            .iter()
            .map(|(key, value)| (key.as_str(), value.canonical()))
            .collect();
        pairs.sort_unstable();

        let mut hasher = DefaultHasher::new();
        pairs.hash(&mut hasher);

        Some(format!(
            "{}:{}:{:016x}",
            context.service_name,
            context.operation_type,
            hasher.finish()
        ))
    }

    /// Store a response under `key`
    ///
    /// `duration` overrides the configured cache duration for this entry.
    ///
    /// # Errors
    ///
    /// [`PluginError::Validation`] for a blank key, a zero duration, or a
    /// duration too large to represent as an expiry time.
    pub fn cache_response(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        duration: Option<Duration>,
    ) -> PluginResult<()> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(PluginError::validation("Cache key must not be blank"));
        }

        let duration = duration.unwrap_or_else(|| self.settings().cache_duration);
        if duration.is_zero() {
            return Err(PluginError::validation("Cache duration must be positive"));
        }
        let ttl = TimeDelta::from_std(duration).map_err(|e| {
            PluginError::validation(format!("Cache duration {duration:?} is out of range: {e}"))
        })?;

        debug!(plugin_id = self.id(), key = %key, ttl_secs = duration.as_secs(), "Caching response");
        self.store.insert(key, value.into(), ttl)
    }

    /// Cached value for `key`, if present and not expired
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.lookup(key)
    }

    /// Remove one entry; returns whether it existed
    pub fn invalidate(&self, key: &str) -> bool {
        self.store.invalidate(key)
    }

    /// Remove expired entries now; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        self.store.sweep_expired()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Number of stored entries, expired but unswept ones included
    pub fn len(&self) -> usize {
        self.store.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.store.hits.load(Ordering::Relaxed),
            misses: self.store.misses.load(Ordering::Relaxed),
            evictions: self.store.evictions.load(Ordering::Relaxed),
            expirations: self.store.expirations.load(Ordering::Relaxed),
            current_entries: self.len(),
        }
    }

    /// Settings in effect
    pub fn settings(&self) -> CacheSettings {
        *self.store.settings.read()
    }

    fn start_sweeper(&self, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                plugin_id = self.id(),
                "No tokio runtime available, expired entries are only skipped on read"
            );
            return;
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.sweeper.lock().replace(token.clone()) {
            previous.cancel();
        }

        let store = Arc::clone(&self.store);
        let plugin_id = self.id().to_string();
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired();
                        if removed > 0 {
                            debug!(plugin_id = %plugin_id, removed, "Swept expired cache entries");
                        }
                    }
                }
            }
            trace!(plugin_id = %plugin_id, "Cache sweeper stopped");
        });
    }
}

impl Drop for CachePlugin {
    fn drop(&mut self) {
        if let Some(token) = self.sweeper.get_mut().take() {
            token.cancel();
        }
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn state(&self) -> &PluginState {
        &self.state
    }

    async fn on_initialize(
        &self,
        config: &PluginConfiguration,
        _cancel: &CancellationToken,
    ) -> PluginResult<()> {
        let settings = CacheSettings::from_configuration(config, self.id());
        *self.store.settings.write() = settings;

        info!(
            plugin_id = self.id(),
            duration_secs = settings.cache_duration.as_secs(),
            max_cache_size = settings.max_cache_size,
            sweep_interval_secs = settings.sweep_interval.as_secs(),
            "Cache configured"
        );

        self.start_sweeper(settings.sweep_interval);
        Ok(())
    }

    async fn on_execute(
        &self,
        context: &mut ExecutionContext<'_>,
        _cancel: &CancellationToken,
    ) -> PluginResult<ExecutionResult> {
        if !Self::is_read_operation(&context.operation_type) {
            return Ok(ExecutionResult::success());
        }

        let Some(key) = Self::cache_key(context) else {
            debug!(
                plugin_id = self.id(),
                operation = %context.operation_type,
                "Request data is not hashable, bypassing cache"
            );
            return Ok(ExecutionResult::success());
        };
        match self.store.lookup(&key) {
            Some(value) => {
                debug!(plugin_id = self.id(), key = %key, "Cache hit");
                Ok(ExecutionResult::success()
                    .with_modification(keys::USE_CACHED_VALUE, true)
                    .with_modification(keys::CACHED_VALUE, value)
                    .with_data(keys::CACHE_HIT, true)
                    .with_data(keys::CACHE_KEY, key))
            }
            None => {
                debug!(plugin_id = self.id(), key = %key, "Cache miss");
                context.set_additional(keys::CACHE_KEY, key.clone());
                Ok(ExecutionResult::success()
                    .with_data(keys::SHOULD_CACHE, true)
                    .with_data(keys::CACHE_KEY, key)
                    .with_data(keys::CACHE_HIT, false))
            }
        }
    }

    async fn on_cleanup(&self, _cancel: &CancellationToken) -> PluginResult<()> {
        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
        }
        self.store.clear();
        Ok(())
    }
}

//! Sliding-window rate limiting per operation
//!
//! Every `ServiceName:OperationType` pair gets its own window: a FIFO queue
//! of the timestamps of admitted requests. On each request, timestamps older
//! than `now - window` are pruned from the front; if the window is still
//! at capacity the request is either rejected (stopping the plugin chain) or,
//! when `BlockExcessRequests` is off, admitted with a warning.

use super::{flag, positive_count, positive_f64};
use crate::clock::{SharedClock, system_clock};
use crate::config::PluginConfiguration;
use crate::context::ExecutionContext;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{Plugin, PluginDescriptor, PluginState};
use crate::result::{ExecutionResult, keys};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default plugin id
pub const RATE_LIMITER_PLUGIN_ID: &str = "rate-limiter";

/// Rate limiting settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Requests admitted per window (`MaxRequestsPerMinute`, default 100)
    pub max_requests: usize,
    /// Window length (`TimeWindowMinutes`, default 1)
    pub window: Duration,
    /// Reject requests over the limit instead of only warning
    /// (`BlockExcessRequests`, default true)
    pub block_excess_requests: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            block_excess_requests: true,
        }
    }
}

impl RateLimitSettings {
    /// Read settings, keeping the default for missing or non-positive values
    pub fn from_configuration(config: &PluginConfiguration, plugin_id: &str) -> Self {
        let defaults = Self::default();
        let minutes = positive_f64(
            config,
            plugin_id,
            "TimeWindowMinutes",
            defaults.window.as_secs_f64() / 60.0,
        );

        Self {
            max_requests: positive_count(
                config,
                plugin_id,
                "MaxRequestsPerMinute",
                defaults.max_requests,
            ),
            window: Duration::try_from_secs_f64(minutes * 60.0).unwrap_or(defaults.window),
            block_excess_requests: flag(
                config,
                plugin_id,
                "BlockExcessRequests",
                defaults.block_excess_requests,
            ),
        }
    }
}

/// Drop timestamps older than one window; `now - window` itself is kept
fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, length: TimeDelta) {
    while window.front().is_some_and(|&oldest| now - oldest > length) {
        window.pop_front();
    }
}

fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

/// Limits requests per operation with a sliding window
#[derive(Debug)]
pub struct RateLimiterPlugin {
    descriptor: PluginDescriptor,
    state: PluginState,
    clock: SharedClock,
    settings: RwLock<RateLimitSettings>,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl Default for RateLimiterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterPlugin {
    /// Create a rate limiter on the system clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a rate limiter reading time from `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            descriptor: PluginDescriptor::new(RATE_LIMITER_PLUGIN_ID, "Rate Limiter", "1.0.0")
                .with_description("Sliding-window request limiting per operation"),
            state: PluginState::new(),
            clock,
            settings: RwLock::new(RateLimitSettings::default()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.descriptor.id = id.into();
        self
    }

    /// Settings in effect
    pub fn settings(&self) -> RateLimitSettings {
        *self.settings.read()
    }

    fn window_length(&self) -> PluginResult<TimeDelta> {
        let window = self.settings().window;
        TimeDelta::from_std(window).map_err(|e| {
            PluginError::configuration(format!("Rate window {window:?} is out of range: {e}"))
        })
    }

    /// Requests counted in the current window for `operation_key`
    pub fn request_count(&self, operation_key: &str) -> usize {
        let Ok(length) = self.window_length() else {
            return 0;
        };
        let now = self.clock.now();

        self.windows.lock().get(operation_key).map_or(0, |window| {
            window.iter().filter(|&&ts| now - ts <= length).count()
        })
    }

    /// Capacity left in the current window for `operation_key`
    pub fn remaining_requests(&self, operation_key: &str) -> usize {
        self.settings()
            .max_requests
            .saturating_sub(self.request_count(operation_key))
    }

    /// Prune every window and forget operations with no recent requests
    ///
    /// Returns how many operation keys were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let Ok(length) = self.window_length() else {
            return 0;
        };
        let now = self.clock.now();

        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            prune(window, now, length);
            !window.is_empty()
        });
        before - windows.len()
    }

    /// Forget all recorded requests
    pub fn reset(&self) {
        self.windows.lock().clear();
    }

    /// Operation keys currently tracked
    pub fn tracked_keys(&self) -> Vec<String> {
        self.windows.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl Plugin for RateLimiterPlugin {
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
        let settings = RateLimitSettings::from_configuration(config, self.id());
        *self.settings.write() = settings;
        // validate once so execution never sees an unrepresentable window
        self.window_length()?;

        info!(
            plugin_id = self.id(),
            max_requests = settings.max_requests,
            window_secs = settings.window.as_secs(),
            block_excess_requests = settings.block_excess_requests,
            "Rate limiter configured"
        );
        Ok(())
    }

    async fn on_execute(
        &self,
        context: &mut ExecutionContext<'_>,
        _cancel: &CancellationToken,
    ) -> PluginResult<ExecutionResult> {
        let settings = self.settings();
        let length = self.window_length()?;
        let operation_key = context.operation_key();
        let max = settings.max_requests;
        let now = self.clock.now();

        let mut windows = self.windows.lock();
        let window = windows.entry(operation_key.clone()).or_default();
        prune(window, now, length);

        if window.len() >= max {
            let current = window.len();
            let oldest = window.front().copied().unwrap_or(now);
            let wait_seconds = seconds(length - (now - oldest));

            if settings.block_excess_requests {
                drop(windows);
                warn!(
                    plugin_id = self.id(),
                    operation = %operation_key,
                    current,
                    max,
                    wait_seconds,
                    "Rate limit exceeded, blocking request"
                );
                return Ok(ExecutionResult::failure(format!(
                    "Rate limit exceeded for {operation_key}. Try again in {wait_seconds:.1} seconds"
                ))
                .halt()
                .with_data(keys::WAIT_TIME_SECONDS, wait_seconds)
                .with_data(keys::CURRENT_REQUESTS, current)
                .with_data(keys::MAX_REQUESTS, max)
                .with_metadata(keys::WAIT_TIME_SECONDS, wait_seconds)
                .with_metadata(keys::CURRENT_REQUESTS, current)
                .with_metadata(keys::MAX_REQUESTS, max));
            }

            window.push_back(now);
            let current = window.len();
            drop(windows);
            warn!(
                plugin_id = self.id(),
                operation = %operation_key,
                current,
                max,
                "Rate limit exceeded, request allowed because blocking is disabled"
            );
            return Ok(ExecutionResult::success()
                .with_data(keys::RATE_LIMIT_EXCEEDED, true)
                .with_data(keys::REMAINING_REQUESTS, 0)
                .with_data(keys::CURRENT_REQUESTS, current)
                .with_data(keys::MAX_REQUESTS, max)
                .with_metadata(keys::REMAINING_REQUESTS, 0)
                .with_metadata(keys::CURRENT_REQUESTS, current)
                .with_metadata(keys::MAX_REQUESTS, max));
        }

        window.push_back(now);
        let current = window.len();
        drop(windows);

        let remaining = max.saturating_sub(current);
        debug!(
            plugin_id = self.id(),
            operation = %operation_key,
            current,
            remaining,
            "Request admitted"
        );
        Ok(ExecutionResult::success()
            .with_data(keys::REMAINING_REQUESTS, remaining)
            .with_data(keys::CURRENT_REQUESTS, current)
            .with_data(keys::MAX_REQUESTS, max)
            .with_metadata(keys::REMAINING_REQUESTS, remaining)
            .with_metadata(keys::CURRENT_REQUESTS, current)
            .with_metadata(keys::MAX_REQUESTS, max))
    }

    async fn on_cleanup(&self, _cancel: &CancellationToken) -> PluginResult<()> {
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::test_support::TestConnection;
    use crate::lifecycle;
    use std::sync::Arc;

    async fn configured_limiter(config: PluginConfiguration) -> (RateLimiterPlugin, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::epoch());
        let limiter = RateLimiterPlugin::with_clock(clock.clone());
        lifecycle::initialize(&limiter, &config, &CancellationToken::new())
            .await
            .unwrap();
        (limiter, clock)
    }

    fn three_per_minute(block: bool) -> PluginConfiguration {
        PluginConfiguration::builder()
            .set("MaxRequestsPerMinute", 3)
            .set("TimeWindowMinutes", 1)
            .set("BlockExcessRequests", block)
            .build()
    }

    #[test]
    fn test_settings_defaults() {
        let settings =
            RateLimitSettings::from_configuration(&PluginConfiguration::empty(), "rate-limiter");
        assert_eq!(settings, RateLimitSettings::default());

        let config = PluginConfiguration::builder()
            .set("MaxRequestsPerMinute", 0)
            .set("TimeWindowMinutes", 0.5)
            .set("BlockExcessRequests", "false")
            .build();
        let settings = RateLimitSettings::from_configuration(&config, "rate-limiter");
        assert_eq!(settings.max_requests, 100);
        assert_eq!(settings.window, Duration::from_secs(30));
        assert!(!settings.block_excess_requests);
    }

    #[tokio::test]
    async fn test_sliding_window_blocks_and_recovers() {
        let (limiter, clock) = configured_limiter(three_per_minute(true)).await;
        let cancel = CancellationToken::new();
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "TaskService", "GetTasks");

        for expected_remaining in [2usize, 1, 0] {
            let result = limiter.on_execute(&mut context, &cancel).await.unwrap();
            assert!(result.is_success);
            assert_eq!(
                result.data_value::<usize>(keys::REMAINING_REQUESTS),
                Some(expected_remaining)
            );
            clock.advance(TimeDelta::seconds(1));
        }

        let blocked = limiter.on_execute(&mut context, &cancel).await.unwrap();
        assert!(!blocked.is_success);
        assert!(!blocked.continue_execution);
        let wait = blocked.data_value::<f64>(keys::WAIT_TIME_SECONDS).unwrap();
        assert!((wait - 57.0).abs() < 1e-9);
        assert_eq!(blocked.data_value::<usize>(keys::CURRENT_REQUESTS), Some(3));
        assert_eq!(blocked.metadata_value::<usize>(keys::MAX_REQUESTS), Some(3));

        clock.advance(TimeDelta::seconds(58));
        let admitted = limiter.on_execute(&mut context, &cancel).await.unwrap();
        assert!(admitted.is_success);
        assert_eq!(limiter.request_count("TaskService:GetTasks"), 3);
    }

    #[tokio::test]
    async fn test_timestamp_exactly_one_window_old_still_counts() {
        let (limiter, clock) = configured_limiter(three_per_minute(true)).await;
        let cancel = CancellationToken::new();
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "TaskService", "GetTasks");

        for _ in 0..3 {
            limiter.on_execute(&mut context, &cancel).await.unwrap();
            clock.advance(TimeDelta::seconds(1));
        }

        // t=60: the t=0 request sits exactly on the window edge
        clock.advance(TimeDelta::seconds(57));
        let blocked = limiter.on_execute(&mut context, &cancel).await.unwrap();
        assert!(!blocked.is_success);
        assert_eq!(blocked.data_value::<f64>(keys::WAIT_TIME_SECONDS), Some(0.0));
        assert_eq!(limiter.request_count("TaskService:GetTasks"), 3);

        clock.advance(TimeDelta::milliseconds(1));
        let admitted = limiter.on_execute(&mut context, &cancel).await.unwrap();
        assert!(admitted.is_success);
    }

    #[tokio::test]
    async fn test_overage_allowed_when_not_blocking() {
        let (limiter, _clock) = configured_limiter(three_per_minute(false)).await;
        let cancel = CancellationToken::new();
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "SpaceService", "CreateSpace");

        for _ in 0..3 {
            limiter.on_execute(&mut context, &cancel).await.unwrap();
        }
        let over = limiter.on_execute(&mut context, &cancel).await.unwrap();

        assert!(over.is_success);
        assert!(over.continue_execution);
        assert_eq!(over.data_value::<bool>(keys::RATE_LIMIT_EXCEEDED), Some(true));
        assert_eq!(over.data_value::<usize>(keys::REMAINING_REQUESTS), Some(0));
        assert_eq!(over.data_value::<usize>(keys::CURRENT_REQUESTS), Some(4));
        assert_eq!(limiter.remaining_requests("SpaceService:CreateSpace"), 0);
    }

    #[tokio::test]
    async fn test_windows_are_per_operation() {
        let (limiter, _clock) = configured_limiter(three_per_minute(true)).await;
        let cancel = CancellationToken::new();
        let connection = TestConnection;

        let mut tasks = ExecutionContext::new(&connection, "TaskService", "GetTasks");
        for _ in 0..3 {
            limiter.on_execute(&mut tasks, &cancel).await.unwrap();
        }
        let mut folders = ExecutionContext::new(&connection, "FolderService", "GetFolders");
        let result = limiter.on_execute(&mut folders, &cancel).await.unwrap();

        assert!(result.is_success);
        assert_eq!(limiter.remaining_requests("TaskService:GetTasks"), 0);
        assert_eq!(limiter.remaining_requests("FolderService:GetFolders"), 2);

        let mut tracked = limiter.tracked_keys();
        tracked.sort();
        assert_eq!(tracked, vec!["FolderService:GetFolders", "TaskService:GetTasks"]);
    }

    #[tokio::test]
    async fn test_cleanup_expired_and_reset() {
        let (limiter, clock) = configured_limiter(three_per_minute(true)).await;
        let cancel = CancellationToken::new();
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "TaskService", "GetTasks");

        limiter.on_execute(&mut context, &cancel).await.unwrap();
        assert_eq!(limiter.cleanup_expired(), 0);

        clock.advance(TimeDelta::seconds(60));
        assert_eq!(limiter.request_count("TaskService:GetTasks"), 1);
        assert_eq!(limiter.cleanup_expired(), 0);

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(limiter.request_count("TaskService:GetTasks"), 0);
        assert_eq!(limiter.cleanup_expired(), 1);
        assert!(limiter.tracked_keys().is_empty());

        limiter.on_execute(&mut context, &cancel).await.unwrap();
        limiter.reset();
        assert!(limiter.tracked_keys().is_empty());
    }
}

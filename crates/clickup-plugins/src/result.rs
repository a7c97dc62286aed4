//! Results produced by plugin invocations and their interpretation
//!
//! Each plugin returns one [`ExecutionResult`]. The manager returns them in
//! execution order, and [`PluginOutcome`] folds that list into the single
//! decision a calling service needs: use a cached value, abort, or perform
//! the real call.

use crate::value::{FromValue, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Well-known keys written by the built-in plugins
pub mod keys {
    /// Modification: the caller should skip the real call
    pub const USE_CACHED_VALUE: &str = "UseCachedValue";
    /// Modification: the value to use instead of the real call
    pub const CACHED_VALUE: &str = "CachedValue";
    /// Data: the caller should store the real response under `CacheKey`
    pub const SHOULD_CACHE: &str = "ShouldCache";
    /// Data / additional context data: the computed cache key
    pub const CACHE_KEY: &str = "CacheKey";
    /// Data: whether the cache lookup hit
    pub const CACHE_HIT: &str = "CacheHit";
    /// Data / metadata: seconds until the rate window frees a slot
    pub const WAIT_TIME_SECONDS: &str = "WaitTimeSeconds";
    /// Data / metadata: requests counted in the current window
    pub const CURRENT_REQUESTS: &str = "CurrentRequests";
    /// Data / metadata: configured window capacity
    pub const MAX_REQUESTS: &str = "MaxRequests";
    /// Data / metadata: capacity left in the current window
    pub const REMAINING_REQUESTS: &str = "RemainingRequests";
    /// Data: the request was admitted over the limit
    pub const RATE_LIMIT_EXCEEDED: &str = "RateLimitExceeded";
}

/// Outcome of one plugin invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Id of the plugin that produced this result (stamped by the manager)
    pub plugin_id: Option<String>,

    pub is_success: bool,

    pub error_message: Option<String>,

    /// Values produced by the plugin
    pub data: HashMap<String, Value>,

    /// Mutations the plugin suggests the caller apply
    pub modifications: HashMap<String, Value>,

    /// `false` stops the manager from dispatching to later plugins
    pub continue_execution: bool,

    /// Diagnostics
    pub metadata: HashMap<String, Value>,
}

impl ExecutionResult {
    /// A successful result that lets the chain continue
    pub fn success() -> Self {
        Self {
            plugin_id: None,
            is_success: true,
            error_message: None,
            data: HashMap::new(),
            modifications: HashMap::new(),
            continue_execution: true,
            metadata: HashMap::new(),
        }
    }

    /// A failed result; the chain still continues unless [`halt`](Self::halt) is applied
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            error_message: Some(message.into()),
            ..Self::success()
        }
    }

    /// Stop dispatch to the remaining plugins
    pub fn halt(mut self) -> Self {
        self.continue_execution = false;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_modification(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.modifications.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn attributed_to(mut self, plugin_id: &str) -> Self {
        self.plugin_id = Some(plugin_id.to_string());
        self
    }

    /// Typed lookup in `data`
    #[must_use]
    pub fn data_value<T: FromValue>(&self, key: &str) -> Option<T> {
        self.data.get(key).and_then(T::from_value)
    }

    /// Typed lookup in `modifications`
    #[must_use]
    pub fn modification<T: FromValue>(&self, key: &str) -> Option<T> {
        self.modifications.get(key).and_then(T::from_value)
    }

    /// Typed lookup in `metadata`
    #[must_use]
    pub fn metadata_value<T: FromValue>(&self, key: &str) -> Option<T> {
        self.metadata.get(key).and_then(T::from_value)
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::success()
    }
}

/// What a calling service should do after running the plugin chain
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOutcome {
    /// Skip the real call and return this value
    UseCached(Value),

    /// Do not perform the call; surface the error to the caller
    Abort {
        plugin_id: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Perform the real call; if `cache_key` is set, store the response under it
    Proceed { cache_key: Option<String> },
}

impl PluginOutcome {
    /// Fold an ordered result list into a single decision
    ///
    /// Results are inspected in order. A halting failure aborts; a
    /// `UseCachedValue` modification short-cuts the call; otherwise the call
    /// proceeds, carrying the first `ShouldCache` key seen. Non-halting
    /// failures are ignored here: they only describe the plugin that failed.
    pub fn from_results(results: &[ExecutionResult]) -> Self {
        let mut cache_key = None;

        for result in results {
            if !result.is_success && !result.continue_execution {
                let retry_after = result
                    .data_value::<f64>(keys::WAIT_TIME_SECONDS)
                    .filter(|secs| secs.is_finite() && *secs >= 0.0)
                    .map(Duration::from_secs_f64);
                return Self::Abort {
                    plugin_id: result.plugin_id.clone(),
                    message: result
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "plugin chain stopped".to_string()),
                    retry_after,
                };
            }

            if result.modification::<bool>(keys::USE_CACHED_VALUE) == Some(true)
                && let Some(value) = result.modifications.get(keys::CACHED_VALUE)
            {
                return Self::UseCached(value.clone());
            }

            if cache_key.is_none() && result.data_value::<bool>(keys::SHOULD_CACHE) == Some(true) {
                cache_key = result.data_value::<String>(keys::CACHE_KEY);
            }
        }

        Self::Proceed { cache_key }
    }
}

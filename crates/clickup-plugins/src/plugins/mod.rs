//! Built-in plugins
//!
//! - [`CachePlugin`]: bounded TTL cache for read operations
//! - [`RateLimiterPlugin`]: sliding-window request limiting per operation
//! - [`LoggingPlugin`]: structured logging of every operation

pub mod cache;
pub mod logging;
pub mod rate_limiter;

pub use cache::{CachePlugin, CacheSettings, CacheStats};
pub use logging::{LogLevel, LoggingPlugin, LoggingSettings};
pub use rate_limiter::{RateLimitSettings, RateLimiterPlugin};

use crate::config::PluginConfiguration;
use tracing::warn;

/// Positive number under `key`, or `default` (with a warning) when the value
/// is present but unusable
fn positive_f64(config: &PluginConfiguration, plugin_id: &str, key: &str, default: f64) -> f64 {
    let Some(raw) = config.raw(key) else {
        return default;
    };

    match config.get::<f64>(key) {
        Some(value) if value.is_finite() && value > 0.0 => value,
        _ => {
            warn!(plugin_id, key, value = %raw, default, "Invalid setting, using default");
            default
        }
    }
}

/// Positive count under `key`, or `default` (with a warning)
fn positive_count(
    config: &PluginConfiguration,
    plugin_id: &str,
    key: &str,
    default: usize,
) -> usize {
    let Some(raw) = config.raw(key) else {
        return default;
    };

    match config.get::<i64>(key) {
        Some(value) if value > 0 => usize::try_from(value).unwrap_or(default),
        _ => {
            warn!(plugin_id, key, value = %raw, default, "Invalid setting, using default");
            default
        }
    }
}

/// Boolean under `key`, or `default` (with a warning)
fn flag(config: &PluginConfiguration, plugin_id: &str, key: &str, default: bool) -> bool {
    let Some(raw) = config.raw(key) else {
        return default;
    };

    config.get::<bool>(key).unwrap_or_else(|| {
        warn!(plugin_id, key, value = %raw, default, "Invalid setting, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_helpers_fall_back() {
        let config: PluginConfiguration = [
            ("Minutes", crate::Value::from(-5)),
            ("Size", crate::Value::from("250")),
            ("Toggle", crate::Value::from("maybe")),
            ("Rate", crate::Value::from(0.5)),
        ]
        .into_iter()
        .collect();

        assert_eq!(positive_f64(&config, "t", "Minutes", 15.0), 15.0);
        assert_eq!(positive_f64(&config, "t", "Rate", 1.0), 0.5);
        assert_eq!(positive_f64(&config, "t", "Missing", 2.0), 2.0);
        assert_eq!(positive_count(&config, "t", "Size", 1000), 250);
        assert_eq!(positive_count(&config, "t", "Minutes", 1000), 1000);
        assert!(flag(&config, "t", "Toggle", true));
        assert!(!flag(&config, "t", "Missing", false));
    }
}

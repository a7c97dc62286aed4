//! Operation logging plugin
//!
//! Emits one structured `tracing` event per operation and never alters the
//! context or the chain.

use super::flag;
use crate::config::PluginConfiguration;
use crate::context::ExecutionContext;
use crate::error::PluginResult;
use crate::plugin::{Plugin, PluginDescriptor, PluginState};
use crate::result::ExecutionResult;
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Default plugin id
pub const LOGGING_PLUGIN_ID: &str = "logging";

/// Longest rendering of a single value in a payload summary
const MAX_VALUE_CHARS: usize = 120;

/// Level operations are logged at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    /// Logged at error level
    Critical,
    /// Nothing is logged; operations are still counted
    None,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "information" | "info" => Ok(Self::Information),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            "none" | "off" => Ok(Self::None),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "Trace",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
            Self::None => "None",
        };
        f.write_str(name)
    }
}

/// Logging settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Include a request data summary (`LogRequestData`, default true)
    pub log_request_data: bool,
    /// Include a response data summary (`LogResponseData`, default true)
    pub log_response_data: bool,
    /// Event level (`LogLevel`, default `Information`)
    pub level: LogLevel,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_request_data: true,
            log_response_data: true,
            level: LogLevel::Information,
        }
    }
}

impl LoggingSettings {
    /// Read settings, keeping the default for missing or unusable values
    pub fn from_configuration(config: &PluginConfiguration, plugin_id: &str) -> Self {
        let defaults = Self::default();
        let level = match config.get::<String>("LogLevel") {
            None => defaults.level,
            Some(raw) => raw.parse::<LogLevel>().unwrap_or_else(|e| {
                warn!(plugin_id, error = %e, "Invalid LogLevel, using default");
                defaults.level
            }),
        };

        Self {
            log_request_data: flag(config, plugin_id, "LogRequestData", defaults.log_request_data),
            log_response_data: flag(
                config,
                plugin_id,
                "LogResponseData",
                defaults.log_response_data,
            ),
            level,
        }
    }
}

/// `key=value` pairs in key order, long values shortened
fn summarize(data: &HashMap<String, Value>) -> String {
    let mut pairs: Vec<(&String, &Value)> = data.iter().collect();
    pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));

    pairs
        .into_iter()
        .map(|(key, value)| {
            let rendered = value.to_string();
            if rendered.chars().count() > MAX_VALUE_CHARS {
                let head: String = rendered.chars().take(MAX_VALUE_CHARS).collect();
                format!("{key}={head}...")
            } else {
                format!("{key}={rendered}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Logs every operation passing through the chain
#[derive(Debug)]
pub struct LoggingPlugin {
    descriptor: PluginDescriptor,
    state: PluginState,
    settings: RwLock<LoggingSettings>,
    observed: AtomicU64,
}

impl Default for LoggingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingPlugin {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(LOGGING_PLUGIN_ID, "Operation Logger", "1.0.0")
                .with_description("Structured logging of API operations"),
            state: PluginState::new(),
            settings: RwLock::new(LoggingSettings::default()),
            observed: AtomicU64::new(0),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.descriptor.id = id.into();
        self
    }

    /// Settings in effect
    pub fn settings(&self) -> LoggingSettings {
        *self.settings.read()
    }

    /// Number of operations observed since creation
    pub fn observed_operations(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }
}

macro_rules! log_operation {
    ($level:expr, $($fields:tt)+) => {
        match $level {
            LogLevel::Trace => trace!($($fields)+),
            LogLevel::Debug => debug!($($fields)+),
            LogLevel::Information => info!($($fields)+),
            LogLevel::Warning => warn!($($fields)+),
            LogLevel::Error | LogLevel::Critical => error!($($fields)+),
            LogLevel::None => {}
        }
    };
}

#[async_trait]
impl Plugin for LoggingPlugin {
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
        let settings = LoggingSettings::from_configuration(config, self.id());
        *self.settings.write() = settings;
        debug!(plugin_id = self.id(), level = %settings.level, "Logging configured");
        Ok(())
    }

    async fn on_execute(
        &self,
        context: &mut ExecutionContext<'_>,
        _cancel: &CancellationToken,
    ) -> PluginResult<ExecutionResult> {
        let settings = self.settings();
        let sequence = self.observed.fetch_add(1, Ordering::Relaxed) + 1;

        let request = if settings.log_request_data {
            summarize(&context.request_data)
        } else {
            String::new()
        };
        let response = if settings.log_response_data {
            summarize(&context.response_data)
        } else {
            String::new()
        };

        log_operation!(
            settings.level,
            plugin_id = self.id(),
            service = %context.service_name,
            operation = %context.operation_type,
            base_url = context.connection.base_url(),
            sequence,
            request = %request,
            response = %response,
            "API operation"
        );

        Ok(ExecutionResult::success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::TestConnection;

    #[test]
    fn test_level_parsing() {
        assert_eq!("Information".parse::<LogLevel>(), Ok(LogLevel::Information));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!(" CRITICAL ".parse::<LogLevel>(), Ok(LogLevel::Critical));
        assert_eq!("off".parse::<LogLevel>(), Ok(LogLevel::None));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Warning.to_string(), "Warning");
    }

    #[test]
    fn test_settings_from_configuration() {
        assert_eq!(
            LoggingSettings::from_configuration(&PluginConfiguration::empty(), "logging"),
            LoggingSettings::default()
        );

        let config = PluginConfiguration::builder()
            .set("LogRequestData", false)
            .set("LogLevel", "Debug")
            .build();
        let settings = LoggingSettings::from_configuration(&config, "logging");
        assert!(!settings.log_request_data);
        assert!(settings.log_response_data);
        assert_eq!(settings.level, LogLevel::Debug);

        let config = PluginConfiguration::builder().set("LogLevel", "chatty").build();
        assert_eq!(
            LoggingSettings::from_configuration(&config, "logging").level,
            LogLevel::Information
        );
    }

    #[test]
    fn test_summary_is_sorted_and_truncated() {
        let mut data = HashMap::new();
        data.insert("b".to_string(), Value::from(2));
        data.insert("a".to_string(), Value::from("x".repeat(200)));

        let summary = summarize(&data);
        assert!(summary.starts_with("a=xxx"));
        assert!(summary.contains("...,"));
        assert!(summary.ends_with("b=2"));
    }

    #[tokio::test]
    async fn test_observer_never_mutates_context() {
        let plugin = LoggingPlugin::new();
        let cancel = CancellationToken::new();
        let config = PluginConfiguration::builder().set("LogLevel", "None").build();
        plugin.on_initialize(&config, &cancel).await.unwrap();

        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "TaskService", "UpdateTask")
            .with_request("task_id", "abc");

        let result = plugin.on_execute(&mut context, &cancel).await.unwrap();
        plugin.on_execute(&mut context, &cancel).await.unwrap();

        assert!(result.is_success);
        assert!(result.continue_execution);
        assert!(result.data.is_empty());
        assert_eq!(context.request_data.len(), 1);
        assert!(context.response_data.is_empty());
        assert!(context.additional_data.is_empty());
        assert_eq!(plugin.observed_operations(), 2);
    }
}

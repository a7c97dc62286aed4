//! Plugin configuration
//!
//! A [`PluginConfiguration`] is the immutable, flat settings map handed to a
//! plugin when it is registered. [`PluginSettings`] loads one such map per
//! plugin id from a settings file, with environment variables overriding file
//! values (12-factor style):
//!
//! ```toml
//! [plugins.cache]
//! CacheDurationMinutes = 5
//! MaxCacheSize = 250
//!
//! [plugins.rate-limiter]
//! MaxRequestsPerMinute = 60
//! BlockExcessRequests = false
//! ```
//!
//! `CLICKUP_PLUGINS__PLUGINS__CACHE__MAXCACHESIZE=500` overrides the cache
//! capacity above. Keys are matched ASCII-case-insensitively because the
//! environment source lower-cases them, and an environment value always
//! replaces the file value for the same key. Environment variable names
//! cannot contain `-`, so `_` in a plugin id is read as `-`:
//! `CLICKUP_PLUGINS__PLUGINS__RATE_LIMITER__MAXREQUESTSPERMINUTE=30` targets
//! the `rate-limiter` section.

use crate::error::{PluginError, PluginResult};
use crate::value::{FromValue, Value};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default environment variable prefix for settings overrides
pub const DEFAULT_ENV_PREFIX: &str = "CLICKUP_PLUGINS";

#[derive(Debug, Clone)]
struct Setting {
    key: String,
    value: Value,
}

/// Immutable string-keyed settings for one plugin
///
/// Cloning is cheap; all clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct PluginConfiguration {
    settings: Arc<HashMap<String, Setting>>,
}

impl PluginConfiguration {
    /// An empty configuration; every typed lookup yields its default
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a configuration
    pub fn builder() -> PluginConfigurationBuilder {
        PluginConfigurationBuilder::default()
    }

    /// Build a configuration from a JSON object
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Configuration`] if `json` is not an object.
    pub fn from_json(json: serde_json::Value) -> PluginResult<Self> {
        match json {
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(key, value)| (key, json_setting(value)))
                .collect()),
            other => Err(PluginError::configuration(format!(
                "plugin configuration must be a JSON object, got {other}"
            ))),
        }
    }

    /// Raw value stored under `key`
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.settings
            .get(&key.to_ascii_lowercase())
            .map(|setting| &setting.value)
    }

    /// Typed lookup; `None` when absent or not convertible to `T`
    #[must_use]
    pub fn get<T: FromValue>(&self, key: &str) -> Option<T> {
        self.raw(key).and_then(T::from_value)
    }

    /// Typed lookup falling back to `default` when absent or not convertible
    #[must_use]
    pub fn get_or<T: FromValue>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.settings.contains_key(&key.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Keys as originally spelled, in no particular order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.settings.values().map(|setting| setting.key.as_str())
    }
}

/// Scalar JSON settings become native values so typed lookups stay exact
fn json_setting(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map_or(Value::Json(serde_json::Value::Number(n)), Value::Float),
        },
        other => Value::Json(other),
    }
}

impl<K, V> FromIterator<(K, V)> for PluginConfiguration
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut builder = Self::builder();
        for (key, value) in iter {
            builder = builder.set(key, value);
        }
        builder.build()
    }
}

/// Builder for [`PluginConfiguration`]
#[derive(Debug, Default)]
pub struct PluginConfigurationBuilder {
    settings: HashMap<String, Setting>,
}

impl PluginConfigurationBuilder {
    /// Set a key; a later call with the same key (in any case) wins
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), value.into());
        self
    }

    fn insert(&mut self, key: String, value: Value) {
        self.settings
            .insert(key.to_ascii_lowercase(), Setting { key, value });
    }

    pub fn build(self) -> PluginConfiguration {
        PluginConfiguration {
            settings: Arc::new(self.settings),
        }
    }
}

/// Errors raised while loading a settings file
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Settings file not found
    #[error("Settings file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported settings file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Settings parsing error
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] config::ConfigError),
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    plugins: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// Section name a plugin id is stored under
fn section_name(plugin_id: &str) -> String {
    plugin_id.to_ascii_lowercase().replace('_', "-")
}

fn env_layer(env_prefix: &str) -> Result<SettingsFile, SettingsError> {
    let config = config::Config::builder()
        .add_source(
            config::Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}

/// Per-plugin settings loaded from a file and the environment
#[derive(Debug, Clone, Default)]
pub struct PluginSettings {
    plugins: HashMap<String, PluginConfiguration>,
}

impl PluginSettings {
    /// Load settings from a file (TOML, YAML, or JSON), overlaying
    /// `CLICKUP_PLUGINS__...` environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist
    /// - The file format is unsupported
    /// - The file contains invalid settings
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        Self::from_file_with_prefix(path, DEFAULT_ENV_PREFIX)
    }

    /// Load settings from a file with a custom environment prefix
    ///
    /// # Errors
    ///
    /// Same conditions as [`PluginSettings::from_file`].
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, SettingsError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();

        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(SettingsError::UnsupportedFormat),
        };

        // file and environment stay separate layers so the environment
        // wins regardless of how each source spells a key
        let file: SettingsFile = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(SettingsError::UnsupportedFormat)?,
                format,
            ))
            .build()?
            .try_deserialize()?;

        Ok(Self::from_layers([file, env_layer(env_prefix)?]))
    }

    /// Load settings from environment variables only
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] if the variables cannot be deserialized.
    pub fn from_env(env_prefix: &str) -> Result<Self, SettingsError> {
        Ok(Self::from_layers([env_layer(env_prefix)?]))
    }

    /// Merge layers in order; a later layer replaces earlier values
    fn from_layers(layers: impl IntoIterator<Item = SettingsFile>) -> Self {
        let mut builders: HashMap<String, PluginConfigurationBuilder> = HashMap::new();

        for layer in layers {
            let mut sections: Vec<_> = layer.plugins.into_iter().collect();
            sections.sort_unstable_by(|a, b| a.0.cmp(&b.0));

            for (id, settings) in sections {
                let builder = builders.entry(section_name(&id)).or_default();
                let mut settings: Vec<_> = settings.into_iter().collect();
                settings.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                for (key, value) in settings {
                    builder.insert(key, json_setting(value));
                }
            }
        }

        let plugins = builders
            .into_iter()
            .map(|(id, builder)| (id, builder.build()))
            .collect();
        Self { plugins }
    }

    /// Configuration for `plugin_id`; empty when the file has no section for it
    #[must_use]
    pub fn configuration_for(&self, plugin_id: &str) -> PluginConfiguration {
        self.plugins
            .get(&section_name(plugin_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Plugin ids that have a settings section
    pub fn plugin_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.plugins.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_typed_lookup_with_default() {
        let config: PluginConfiguration = [
            ("MaxCacheSize", Value::from(250)),
            ("BlockExcessRequests", Value::from("false")),
        ]
        .into_iter()
        .collect();

        assert_eq!(config.get_or("MaxCacheSize", 1000usize), 250);
        assert!(!config.get_or("BlockExcessRequests", true));
        assert_eq!(config.get_or("CacheDurationMinutes", 15i64), 15);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let config = PluginConfiguration::builder()
            .set("LogLevel", "Debug")
            .build();

        assert_eq!(config.get::<String>("loglevel").as_deref(), Some("Debug"));
        assert!(config.contains("LOGLEVEL"));
        assert_eq!(config.keys().collect::<Vec<_>>(), vec!["LogLevel"]);
    }

    #[test]
    fn test_unconvertible_value_falls_back() {
        let config = PluginConfiguration::builder()
            .set("MaxRequestsPerMinute", "lots")
            .build();

        assert_eq!(config.get::<u32>("MaxRequestsPerMinute"), None);
        assert_eq!(config.get_or("MaxRequestsPerMinute", 100u32), 100);
    }

    #[test]
    fn test_from_json() {
        let config = PluginConfiguration::from_json(json!({
            "CacheDurationMinutes": 5,
            "Ratio": 0.5,
            "Tags": ["a", "b"]
        }))
        .unwrap();

        assert_eq!(config.raw("CacheDurationMinutes"), Some(&Value::Int(5)));
        assert_eq!(config.get::<f64>("Ratio"), Some(0.5));
        assert!(matches!(config.raw("Tags"), Some(Value::Json(_))));

        assert!(PluginConfiguration::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn test_settings_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[plugins.cache]
CacheDurationMinutes = 5
MaxCacheSize = 250

[plugins.rate-limiter]
BlockExcessRequests = false
"#
        )
        .unwrap();

        let settings =
            PluginSettings::from_file_with_prefix(file.path(), "CLICKUP_PLUGINS_TEST_TOML").unwrap();

        let cache = settings.configuration_for("cache");
        assert_eq!(cache.get::<i64>("CacheDurationMinutes"), Some(5));
        assert_eq!(cache.get::<usize>("MaxCacheSize"), Some(250));

        let limiter = settings.configuration_for("rate-limiter");
        assert_eq!(limiter.get::<bool>("BlockExcessRequests"), Some(false));

        assert!(settings.configuration_for("logging").is_empty());
    }

    #[test]
    fn test_settings_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"plugins": {{"logging": {{"LogLevel": "Warning", "LogResponseData": false}}}}}}"#
        )
        .unwrap();

        let settings =
            PluginSettings::from_file_with_prefix(file.path(), "CLICKUP_PLUGINS_TEST_JSON").unwrap();
        let logging = settings.configuration_for("logging");
        assert_eq!(logging.get::<String>("LogLevel").as_deref(), Some("Warning"));
        assert_eq!(logging.get::<bool>("LogResponseData"), Some(false));
    }

    #[test]
    fn test_environment_overrides_file_deterministically() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[plugins.cache]
MaxCacheSize = 250
CacheDurationMinutes = 5

[plugins.rate-limiter]
MaxRequestsPerMinute = 60
"#
        )
        .unwrap();

        let prefix = "CLICKUP_PLUGINS_TEST_OVERRIDE";
        // SAFETY: the variables use a prefix no other test reads
        unsafe {
            std::env::set_var(format!("{prefix}__PLUGINS__CACHE__MAXCACHESIZE"), "500");
            std::env::set_var(
                format!("{prefix}__PLUGINS__RATE_LIMITER__MAXREQUESTSPERMINUTE"),
                "30",
            );
        }

        for _ in 0..20 {
            let settings = PluginSettings::from_file_with_prefix(file.path(), prefix).unwrap();

            let cache = settings.configuration_for("cache");
            assert_eq!(cache.get::<i64>("MaxCacheSize"), Some(500));
            assert_eq!(cache.get::<i64>("CacheDurationMinutes"), Some(5));
            assert_eq!(cache.len(), 2);

            let limiter = settings.configuration_for("rate-limiter");
            assert_eq!(limiter.get::<i64>("MaxRequestsPerMinute"), Some(30));
            assert_eq!(
                settings.configuration_for("rate_limiter").len(),
                limiter.len()
            );
        }

        unsafe {
            std::env::remove_var(format!("{prefix}__PLUGINS__CACHE__MAXCACHESIZE"));
            std::env::remove_var(format!("{prefix}__PLUGINS__RATE_LIMITER__MAXREQUESTSPERMINUTE"));
        }
    }

    #[test]
    fn test_settings_from_env_only() {
        let prefix = "CLICKUP_PLUGINS_TEST_ENV_ONLY";
        // SAFETY: the variable uses a prefix no other test reads
        unsafe {
            std::env::set_var(format!("{prefix}__PLUGINS__LOGGING__LOGLEVEL"), "Warning");
        }

        let settings = PluginSettings::from_env(prefix).unwrap();
        assert_eq!(
            settings
                .configuration_for("Logging")
                .get::<String>("LogLevel")
                .as_deref(),
            Some("Warning")
        );

        unsafe {
            std::env::remove_var(format!("{prefix}__PLUGINS__LOGGING__LOGLEVEL"));
        }
    }

    #[test]
    fn test_settings_missing_file() {
        let result = PluginSettings::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(SettingsError::FileNotFound(_))));
    }

    #[test]
    fn test_settings_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result = PluginSettings::from_file(file.path());
        assert!(matches!(result, Err(SettingsError::UnsupportedFormat)));
    }
}

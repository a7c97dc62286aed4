//! # ClickUp Client Plugins
//!
//! Cross-cutting plugin framework for the ClickUp API client. Plugins are
//! attached once to a [`PluginManager`] and run, in registration order,
//! around every API operation a service performs.
//!
//! ## Features
//!
//! - Ordered plugin chain with short-circuit (`continue_execution == false`)
//! - Per-plugin error and panic isolation
//! - Manager-side enable/disable overrides
//! - Bounded TTL response cache with oldest-first eviction
//! - Sliding-window rate limiting per operation
//! - Structured operation logging through `tracing`
//! - Settings files (TOML/YAML/JSON) with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! Calling service (TaskService, SpaceService, ...)
//!        ↓  ExecutionContext
//! PluginManager::execute
//!        ↓  one ExecutionResult per plugin
//! PluginOutcome::from_results → use cached value / abort / perform call
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use clickup_plugins::{
//!     ApiConnection, CachePlugin, ExecutionContext, PluginConfiguration, PluginManager,
//!     PluginOutcome, RateLimiterPlugin,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct Connection;
//!
//! impl ApiConnection for Connection {
//!     fn base_url(&self) -> &str {
//!         "https://api.clickup.com/api/v2"
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let manager = PluginManager::new();
//! let cache = Arc::new(CachePlugin::new());
//! manager.register(Arc::new(RateLimiterPlugin::new()), PluginConfiguration::empty(), &cancel).await?;
//! manager.register(cache.clone(), PluginConfiguration::empty(), &cancel).await?;
//!
//! let connection = Connection;
//! let mut context = ExecutionContext::new(&connection, "TaskService", "GetTasks")
//!     .with_request("list_id", "901");
//! let results = manager.execute(&mut context, &cancel).await?;
//!
//! match PluginOutcome::from_results(&results) {
//!     PluginOutcome::UseCached(value) => println!("cached: {value}"),
//!     PluginOutcome::Abort { message, .. } => eprintln!("{message}"),
//!     PluginOutcome::Proceed { cache_key } => {
//!         let response = "[]"; // perform the real call here
//!         if let Some(key) = cache_key {
//!             cache.cache_response(key, response, None)?;
//!         }
//!     }
//! }
//!
//! manager.dispose(&cancel).await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod plugin;
pub mod plugins;
pub mod result;
pub mod value;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    DEFAULT_ENV_PREFIX, PluginConfiguration, PluginConfigurationBuilder, PluginSettings,
    SettingsError,
};
pub use context::{ApiConnection, ExecutionContext};
pub use error::{PluginError, PluginResult};
pub use manager::PluginManager;
pub use plugin::{Plugin, PluginDescriptor, PluginState};
pub use plugins::{
    CachePlugin, CacheSettings, CacheStats, LogLevel, LoggingPlugin, LoggingSettings,
    RateLimitSettings, RateLimiterPlugin,
};
pub use result::{ExecutionResult, PluginOutcome, keys};
pub use value::{FromValue, Value};

//! Plugin chain demo
//!
//! Runs a simulated task service through the cache, rate limiter and logging
//! plugins. Pass a settings file (TOML/YAML/JSON) as the first argument to
//! override the built-in demo settings:
//!
//! ```text
//! RUST_LOG=debug cargo run -p clickup-plugins-demo -- plugins.toml
//! ```

use anyhow::Context as _;
use clickup_plugins::plugins::cache::CACHE_PLUGIN_ID;
use clickup_plugins::plugins::logging::LOGGING_PLUGIN_ID;
use clickup_plugins::plugins::rate_limiter::RATE_LIMITER_PLUGIN_ID;
use clickup_plugins::{
    ApiConnection, CachePlugin, ExecutionContext, LoggingPlugin, PluginConfiguration,
    PluginManager, PluginOutcome, PluginSettings, RateLimiterPlugin, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct DemoConnection {
    team_id: String,
}

impl ApiConnection for DemoConnection {
    fn base_url(&self) -> &str {
        "https://api.clickup.com/api/v2"
    }

    fn connection_id(&self) -> Option<&str> {
        Some(self.team_id.as_str())
    }
}

/// Stand-in for a generated service; the remote call is simulated
struct TaskService {
    manager: Arc<PluginManager>,
    cache: Arc<CachePlugin>,
    connection: DemoConnection,
    remote_calls: AtomicUsize,
}

impl TaskService {
    async fn get_tasks(&self, list_id: &str, cancel: &CancellationToken) -> anyhow::Result<Value> {
        let mut context = ExecutionContext::new(&self.connection, "TaskService", "GetTasks")
            .with_request("list_id", list_id)
            .with_request("archived", false);

        let results = self.manager.execute(&mut context, cancel).await?;
        match PluginOutcome::from_results(&results) {
            PluginOutcome::UseCached(value) => {
                info!(list_id, "Served from cache");
                Ok(value)
            }
            PluginOutcome::Abort {
                plugin_id,
                message,
                retry_after,
            } => {
                anyhow::bail!(
                    "{} (plugin: {}, retry after: {:?})",
                    message,
                    plugin_id.unwrap_or_default(),
                    retry_after
                )
            }
            PluginOutcome::Proceed { cache_key } => {
                let call = self.remote_calls.fetch_add(1, Ordering::SeqCst) + 1;
                let response = Value::Json(serde_json::json!({
                    "tasks": [
                        {"id": format!("task-{call}"), "list_id": list_id, "status": "open"}
                    ]
                }));

                if let Some(key) = cache_key {
                    self.cache.cache_response(key, response.clone(), None)?;
                }
                Ok(response)
            }
        }
    }
}

fn demo_configuration(
    settings: Option<&PluginSettings>,
    plugin_id: &str,
    fallback: PluginConfiguration,
) -> PluginConfiguration {
    match settings {
        Some(settings) => settings.configuration_for(plugin_id),
        None => fallback,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => Some(
            PluginSettings::from_file(&path)
                .with_context(|| format!("loading plugin settings from {path}"))?,
        ),
        None => None,
    };

    let cancel = CancellationToken::new();
    let manager = Arc::new(PluginManager::new());
    let cache = Arc::new(CachePlugin::new());

    manager
        .register(
            Arc::new(LoggingPlugin::new()),
            demo_configuration(
                settings.as_ref(),
                LOGGING_PLUGIN_ID,
                PluginConfiguration::builder()
                    .set("LogLevel", "Debug")
                    .build(),
            ),
            &cancel,
        )
        .await?;
    manager
        .register(
            Arc::new(RateLimiterPlugin::new()),
            demo_configuration(
                settings.as_ref(),
                RATE_LIMITER_PLUGIN_ID,
                PluginConfiguration::builder()
                    .set("MaxRequestsPerMinute", 4)
                    .build(),
            ),
            &cancel,
        )
        .await?;
    manager
        .register(
            cache.clone(),
            demo_configuration(
                settings.as_ref(),
                CACHE_PLUGIN_ID,
                PluginConfiguration::builder()
                    .set("CacheDurationMinutes", 5)
                    .set("MaxCacheSize", 100)
                    .build(),
            ),
            &cancel,
        )
        .await?;

    info!(plugins = ?manager.plugin_ids(), "Plugin chain ready");

    let service = TaskService {
        manager: Arc::clone(&manager),
        cache: Arc::clone(&cache),
        connection: DemoConnection {
            team_id: "team-42".to_string(),
        },
        remote_calls: AtomicUsize::new(0),
    };

    for list_id in ["901", "901", "902", "903", "904", "905"] {
        match service.get_tasks(list_id, &cancel).await {
            Ok(tasks) => info!(list_id, %tasks, "GetTasks succeeded"),
            Err(e) => warn!(list_id, error = %e, "GetTasks rejected"),
        }
    }

    let stats = cache.stats();
    info!(
        remote_calls = service.remote_calls.load(Ordering::SeqCst),
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        cached_entries = stats.current_entries,
        "Demo finished"
    );

    manager.dispose(&cancel).await;
    Ok(())
}

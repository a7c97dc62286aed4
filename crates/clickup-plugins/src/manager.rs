//! Plugin manager for registering plugins and running the plugin chain
//!
//! The [`PluginManager`] owns the registry of plugins attached to one API
//! client. Plugins run in registration order around every operation; the
//! chain stops early when a plugin returns `continue_execution == false`, and
//! a plugin that errors or panics only fails its own entry in the result list.

use crate::config::PluginConfiguration;
use crate::context::ExecutionContext;
use crate::error::{PluginError, PluginResult};
use crate::lifecycle::{self, panic_message};
use crate::plugin::Plugin;
use crate::result::ExecutionResult;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    configuration: PluginConfiguration,
    /// Manager-side override; authoritative over the plugin-local flag
    enabled: bool,
}

impl PluginEntry {
    fn is_effectively_enabled(&self) -> bool {
        self.enabled && self.plugin.is_enabled()
    }
}

/// Plugins in registration order plus an id index
#[derive(Debug, Default)]
struct Registry {
    entries: Vec<PluginEntry>,
    index: HashMap<String, usize>,
}

impl Registry {
    fn get(&self, id: &str) -> Option<&PluginEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut PluginEntry> {
        self.index.get(id).map(|&i| &mut self.entries[i])
    }

    fn insert(&mut self, id: String, entry: PluginEntry) -> usize {
        let position = self.entries.len();
        self.entries.push(entry);
        self.index.insert(id, position);
        position
    }

    fn remove(&mut self, id: &str) -> Option<PluginEntry> {
        let position = self.index.remove(id)?;
        let entry = self.entries.remove(position);

        for slot in self.index.values_mut() {
            if *slot > position {
                *slot -= 1;
            }
        }
        Some(entry)
    }
}

/// Registry and execution chain for plugins
///
/// All methods take `&self`; share the manager behind an `Arc` between the
/// services of one client. Registration, unregistration and disposal are
/// serialized by an async admission lock that is held across plugin
/// initialization, while [`execute`](Self::execute) only takes a short
/// snapshot of the registry and never waits on that lock.
///
/// # Examples
///
/// ```rust,no_run
/// use clickup_plugins::{CachePlugin, PluginConfiguration, PluginManager};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = PluginManager::new();
/// let cancel = CancellationToken::new();
///
/// let cache = Arc::new(CachePlugin::new());
/// manager
///     .register(cache, PluginConfiguration::empty(), &cancel)
///     .await?;
///
/// assert_eq!(manager.plugin_count(), 1);
/// manager.dispose(&cancel).await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct PluginManager {
    registry: RwLock<Registry>,
    admission: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl PluginManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and initialize a plugin
    ///
    /// Returns `Ok(true)` when the plugin was admitted and `Ok(false)` when a
    /// plugin with the same id is already registered; in the latter case the
    /// new instance is not initialized.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Validation`] if the plugin id is blank
    /// - [`PluginError::AlreadyDisposed`] if [`dispose`](Self::dispose) has run
    /// - [`PluginError::Cancelled`] if `cancel` fired before initialization
    /// - any error returned by the plugin's initialization hook
    pub async fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        configuration: PluginConfiguration,
        cancel: &CancellationToken,
    ) -> PluginResult<bool> {
        let plugin_id = plugin.id().to_string();
        if plugin_id.trim().is_empty() {
            return Err(PluginError::validation("Plugin id must not be blank"));
        }
        if self.is_disposed() {
            return Err(PluginError::AlreadyDisposed);
        }

        let _admission = self.admission.lock().await;

        // dispose may have completed while we waited
        if self.is_disposed() {
            return Err(PluginError::AlreadyDisposed);
        }

        if self.registry.read().index.contains_key(&plugin_id) {
            warn!(
                plugin_id = %plugin_id,
                "Plugin is already registered, ignoring duplicate registration"
            );
            return Ok(false);
        }

        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        info!(plugin_id = %plugin_id, version = plugin.version(), "Registering plugin");

        lifecycle::initialize(plugin.as_ref(), &configuration, cancel)
            .await
            .map_err(|e| {
                error!(plugin_id = %plugin_id, error = %e, "Failed to initialize plugin");
                e
            })?;

        let position = self.registry.write().insert(
            plugin_id.clone(),
            PluginEntry {
                plugin,
                configuration,
                enabled: true,
            },
        );

        debug!(plugin_id = %plugin_id, position, "Plugin registered");
        Ok(true)
    }

    /// Remove a plugin and clean it up
    ///
    /// Cleanup failures are logged and not returned. Returns whether a plugin
    /// with `plugin_id` was registered.
    pub async fn unregister(&self, plugin_id: &str, cancel: &CancellationToken) -> bool {
        let _admission = self.admission.lock().await;

        let Some(entry) = self.registry.write().remove(plugin_id) else {
            debug!(plugin_id, "Plugin not registered, nothing to unregister");
            return false;
        };

        lifecycle::cleanup(entry.plugin.as_ref(), cancel).await;
        info!(plugin_id, "Plugin unregistered");
        true
    }

    /// The registered plugin instance for `plugin_id`
    pub fn get_plugin(&self, plugin_id: &str) -> Option<Arc<dyn Plugin>> {
        self.registry
            .read()
            .get(plugin_id)
            .map(|entry| Arc::clone(&entry.plugin))
    }

    /// The configuration the plugin was registered with
    pub fn get_configuration(&self, plugin_id: &str) -> Option<PluginConfiguration> {
        self.registry
            .read()
            .get(plugin_id)
            .map(|entry| entry.configuration.clone())
    }

    /// Registered plugin ids in execution order
    pub fn plugin_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .entries
            .iter()
            .map(|entry| entry.plugin.id().to_string())
            .collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.registry.read().entries.len()
    }

    /// Whether the plugin would currently take part in execution
    ///
    /// `false` for unknown ids.
    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.registry
            .read()
            .get(plugin_id)
            .is_some_and(PluginEntry::is_effectively_enabled)
    }

    /// Re-enable a plugin for this manager; returns whether the id is registered
    pub fn enable(&self, plugin_id: &str) -> bool {
        self.set_enabled(plugin_id, true)
    }

    /// Exclude a plugin from execution without unregistering it
    ///
    /// Returns whether the id is registered.
    pub fn disable(&self, plugin_id: &str) -> bool {
        self.set_enabled(plugin_id, false)
    }

    fn set_enabled(&self, plugin_id: &str, enabled: bool) -> bool {
        match self.registry.write().get_mut(plugin_id) {
            Some(entry) => {
                entry.enabled = enabled;
                debug!(plugin_id, enabled, "Plugin enabled flag changed");
                true
            }
            None => false,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Run every enabled plugin against `context`
    ///
    /// See [`execute_filtered`](Self::execute_filtered).
    ///
    /// # Errors
    ///
    /// [`PluginError::Cancelled`] if `cancel` fires before a plugin is invoked.
    pub async fn execute(
        &self,
        context: &mut ExecutionContext<'_>,
        cancel: &CancellationToken,
    ) -> PluginResult<Vec<ExecutionResult>> {
        self.execute_filtered(context, |_| true, cancel).await
    }

    /// Run the enabled plugins accepted by `filter` against `context`
    ///
    /// The set of plugins is a snapshot taken when the call starts; plugins
    /// registered or unregistered concurrently do not affect a chain that is
    /// already running. Plugins run one at a time in registration order and
    /// each produces exactly one result, stamped with its plugin id. An
    /// error or panic inside a plugin becomes a failed result for that
    /// plugin and the chain goes on; a result with
    /// `continue_execution == false` ends the chain.
    ///
    /// # Errors
    ///
    /// [`PluginError::Cancelled`] if `cancel` fires before a plugin is invoked.
    pub async fn execute_filtered<F>(
        &self,
        context: &mut ExecutionContext<'_>,
        filter: F,
        cancel: &CancellationToken,
    ) -> PluginResult<Vec<ExecutionResult>>
    where
        F: Fn(&dyn Plugin) -> bool,
    {
        let snapshot: Vec<Arc<dyn Plugin>> = {
            let registry = self.registry.read();
            registry
                .entries
                .iter()
                .filter(|entry| entry.is_effectively_enabled() && filter(entry.plugin.as_ref()))
                .map(|entry| Arc::clone(&entry.plugin))
                .collect()
        };

        debug!(
            service = %context.service_name,
            operation = %context.operation_type,
            plugins = snapshot.len(),
            "Executing plugin chain"
        );

        let mut results = Vec::with_capacity(snapshot.len());
        for plugin in snapshot {
            if cancel.is_cancelled() {
                debug!(completed = results.len(), "Plugin chain cancelled");
                return Err(PluginError::Cancelled);
            }

            let plugin_id = plugin.id();
            let outcome = AssertUnwindSafe(lifecycle::execute(plugin.as_ref(), context, cancel))
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    error!(plugin_id, error = %e, "Plugin execution failed");
                    ExecutionResult::failure(format!("Plugin '{plugin_id}' failed: {e}"))
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(plugin_id, panic = %message, "Plugin panicked during execution");
                    ExecutionResult::failure(format!("Plugin '{plugin_id}' panicked: {message}"))
                }
            }
            .attributed_to(plugin_id);

            let halted = !result.continue_execution;
            results.push(result);

            if halted {
                debug!(plugin_id, "Plugin stopped the chain");
                break;
            }
        }

        Ok(results)
    }

    /// Clean up every plugin and clear the registry
    ///
    /// Cleanups run concurrently and each failure is logged on its own.
    /// Calling this more than once is a no-op, and registration is rejected
    /// from the first call on.
    pub async fn dispose(&self, cancel: &CancellationToken) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            debug!("Plugin manager already disposed");
            return;
        }

        let _admission = self.admission.lock().await;
        let registry = std::mem::take(&mut *self.registry.write());

        info!(plugins = registry.entries.len(), "Disposing plugin manager");
        join_all(
            registry
                .entries
                .iter()
                .map(|entry| lifecycle::cleanup(entry.plugin.as_ref(), cancel)),
        )
        .await;
    }
}

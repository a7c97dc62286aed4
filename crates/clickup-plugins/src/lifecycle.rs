//! Lifecycle guards shared by every plugin
//!
//! These functions wrap a plugin's hooks with the behaviour all plugins
//! share. The manager always goes through them; calling a hook directly
//! bypasses the guards.

use crate::config::PluginConfiguration;
use crate::context::ExecutionContext;
use crate::error::PluginResult;
use crate::plugin::Plugin;
use crate::result::ExecutionResult;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initialize `plugin` unless it already is
///
/// A second call on an initialized plugin logs a warning and succeeds
/// without invoking the hook again.
///
/// # Errors
///
/// Propagates any error returned by [`Plugin::on_initialize`]; the plugin
/// stays uninitialized in that case.
pub async fn initialize(
    plugin: &dyn Plugin,
    config: &PluginConfiguration,
    cancel: &CancellationToken,
) -> PluginResult<()> {
    if plugin.is_initialized() {
        warn!(
            plugin_id = plugin.id(),
            "Plugin is already initialized, ignoring repeated initialization"
        );
        return Ok(());
    }

    plugin.on_initialize(config, cancel).await?;
    plugin.state().mark_initialized();

    info!(
        plugin_id = plugin.id(),
        version = plugin.version(),
        settings = config.len(),
        "Plugin initialized"
    );
    Ok(())
}

/// Execute `plugin` for one operation
///
/// An uninitialized plugin yields a failed result and a disabled plugin a
/// no-op success; neither reaches [`Plugin::on_execute`].
///
/// # Errors
///
/// Propagates any error returned by [`Plugin::on_execute`].
pub async fn execute(
    plugin: &dyn Plugin,
    context: &mut ExecutionContext<'_>,
    cancel: &CancellationToken,
) -> PluginResult<ExecutionResult> {
    if !plugin.is_initialized() {
        return Ok(ExecutionResult::failure(format!(
            "Plugin '{}' is not initialized",
            plugin.id()
        )));
    }

    if !plugin.is_enabled() {
        debug!(plugin_id = plugin.id(), "Plugin disabled, skipping");
        return Ok(ExecutionResult::success());
    }

    plugin.on_execute(context, cancel).await
}

/// Clean up `plugin`, logging instead of propagating any failure
///
/// Panics inside the hook are caught and logged as well. The plugin is
/// marked uninitialized afterwards regardless of the outcome.
pub async fn cleanup(plugin: &dyn Plugin, cancel: &CancellationToken) {
    let outcome = AssertUnwindSafe(plugin.on_cleanup(cancel))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => debug!(plugin_id = plugin.id(), "Plugin cleaned up"),
        Ok(Err(e)) => warn!(plugin_id = plugin.id(), error = %e, "Plugin cleanup failed"),
        Err(payload) => warn!(
            plugin_id = plugin.id(),
            panic = %panic_message(payload.as_ref()),
            "Plugin cleanup panicked"
        ),
    }

    plugin.state().mark_uninitialized();
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::TestConnection;
    use crate::error::PluginError;
    use crate::plugin::{PluginDescriptor, PluginState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingPlugin {
        descriptor: PluginDescriptor,
        state: PluginState,
        init_calls: AtomicUsize,
        execute_calls: AtomicUsize,
        fail_init: bool,
        panic_on_cleanup: bool,
    }

    impl CountingPlugin {
        fn new() -> Self {
            Self {
                descriptor: PluginDescriptor::new("counting", "Counting", "1.0.0"),
                state: PluginState::new(),
                init_calls: AtomicUsize::new(0),
                execute_calls: AtomicUsize::new(0),
                fail_init: false,
                panic_on_cleanup: false,
            }
        }
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn descriptor(&self) -> &PluginDescriptor {
            &self.descriptor
        }

        fn state(&self) -> &PluginState {
            &self.state
        }

        async fn on_initialize(
            &self,
            _config: &PluginConfiguration,
            _cancel: &CancellationToken,
        ) -> PluginResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                Err(PluginError::initialization("missing credentials"))
            } else {
                Ok(())
            }
        }

        async fn on_execute(
            &self,
            _context: &mut ExecutionContext<'_>,
            _cancel: &CancellationToken,
        ) -> PluginResult<ExecutionResult> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResult::success().with_data("ran", true))
        }

        async fn on_cleanup(&self, _cancel: &CancellationToken) -> PluginResult<()> {
            if self.panic_on_cleanup {
                panic!("cleanup exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let plugin = CountingPlugin::new();
        let cancel = CancellationToken::new();
        let config = PluginConfiguration::empty();

        initialize(&plugin, &config, &cancel).await.unwrap();
        initialize(&plugin, &config, &cancel).await.unwrap();

        assert_eq!(plugin.init_calls.load(Ordering::SeqCst), 1);
        assert!(plugin.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_failure_propagates() {
        let plugin = CountingPlugin {
            fail_init: true,
            ..CountingPlugin::new()
        };
        let cancel = CancellationToken::new();

        let result = initialize(&plugin, &PluginConfiguration::empty(), &cancel).await;
        assert!(matches!(result, Err(PluginError::Initialization { .. })));
        assert!(!plugin.is_initialized());
    }

    #[tokio::test]
    async fn test_execute_guards() {
        let plugin = CountingPlugin::new();
        let cancel = CancellationToken::new();
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "TaskService", "GetTasks");

        let result = execute(&plugin, &mut context, &cancel).await.unwrap();
        assert!(!result.is_success);
        assert!(result.error_message.unwrap().contains("not initialized"));

        initialize(&plugin, &PluginConfiguration::empty(), &cancel)
            .await
            .unwrap();
        plugin.disable();
        let result = execute(&plugin, &mut context, &cancel).await.unwrap();
        assert!(result.is_success);
        assert!(result.data.is_empty());
        assert_eq!(plugin.execute_calls.load(Ordering::SeqCst), 0);

        plugin.enable();
        let result = execute(&plugin, &mut context, &cancel).await.unwrap();
        assert_eq!(result.data_value::<bool>("ran"), Some(true));
        assert_eq!(plugin.execute_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_swallows_panics() {
        let plugin = CountingPlugin {
            panic_on_cleanup: true,
            ..CountingPlugin::new()
        };
        let cancel = CancellationToken::new();
        initialize(&plugin, &PluginConfiguration::empty(), &cancel)
            .await
            .unwrap();

        cleanup(&plugin, &cancel).await;
        assert!(!plugin.is_initialized());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}

//! The plugin contract
//!
//! A plugin supplies three hooks: [`Plugin::on_initialize`],
//! [`Plugin::on_execute`] and optionally [`Plugin::on_cleanup`]. The guards
//! shared by every plugin (idempotent initialization, skipping disabled or
//! uninitialized plugins, swallowing cleanup failures) live in
//! [`crate::lifecycle`] and are applied by the manager, so a plugin author
//! writes only the behaviour that is specific to their plugin.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use clickup_plugins::{
//!     ExecutionContext, ExecutionResult, Plugin, PluginConfiguration, PluginDescriptor,
//!     PluginResult, PluginState,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! struct AuditPlugin {
//!     descriptor: PluginDescriptor,
//!     state: PluginState,
//! }
//!
//! #[async_trait]
//! impl Plugin for AuditPlugin {
//!     fn descriptor(&self) -> &PluginDescriptor {
//!         &self.descriptor
//!     }
//!
//!     fn state(&self) -> &PluginState {
//!         &self.state
//!     }
//!
//!     async fn on_initialize(
//!         &self,
//!         _config: &PluginConfiguration,
//!         _cancel: &CancellationToken,
//!     ) -> PluginResult<()> {
//!         Ok(())
//!     }
//!
//!     async fn on_execute(
//!         &self,
//!         context: &mut ExecutionContext<'_>,
//!         _cancel: &CancellationToken,
//!     ) -> PluginResult<ExecutionResult> {
//!         Ok(ExecutionResult::success().with_metadata("Audited", context.operation_key()))
//!     }
//! }
//! ```

use crate::config::PluginConfiguration;
use crate::context::ExecutionContext;
use crate::error::PluginResult;
use crate::result::ExecutionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Identity of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Globally unique plugin id
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Version
    pub version: String,
    /// Description
    pub description: String,
}

impl PluginDescriptor {
    /// Create a new descriptor
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Mutable lifecycle flags every plugin carries
///
/// Plugins start enabled and uninitialized. The enabled flag here is the
/// plugin-local one; the manager keeps its own override per registration.
#[derive(Debug)]
pub struct PluginState {
    initialized: AtomicBool,
    enabled: AtomicBool,
}

impl PluginState {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn mark_uninitialized(&self) {
        self.initialized.store(false, Ordering::Release);
    }
}

impl Default for PluginState {
    fn default() -> Self {
        Self::new()
    }
}

/// Core trait for plugins attached around API operations
///
/// Plugins are shared across concurrent callers (`&self` everywhere), so any
/// state they keep needs interior mutability.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Plugin identity
    fn descriptor(&self) -> &PluginDescriptor;

    /// Plugin lifecycle flags
    fn state(&self) -> &PluginState;

    /// Plugin id - must be unique within a manager
    fn id(&self) -> &str {
        &self.descriptor().id
    }

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn version(&self) -> &str {
        &self.descriptor().version
    }

    fn description(&self) -> &str {
        &self.descriptor().description
    }

    /// Plugin-local enabled flag
    fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    fn is_initialized(&self) -> bool {
        self.state().is_initialized()
    }

    /// Set the plugin-local enabled flag
    fn enable(&self) {
        self.state().set_enabled(true);
    }

    /// Clear the plugin-local enabled flag
    fn disable(&self) {
        self.state().set_enabled(false);
    }

    /// Read settings and acquire resources
    ///
    /// Called at most once per successful initialization; an error here
    /// prevents registration.
    async fn on_initialize(
        &self,
        config: &PluginConfiguration,
        cancel: &CancellationToken,
    ) -> PluginResult<()>;

    /// Run the plugin for one operation
    ///
    /// Only called when the plugin is initialized and enabled.
    async fn on_execute(
        &self,
        context: &mut ExecutionContext<'_>,
        cancel: &CancellationToken,
    ) -> PluginResult<ExecutionResult>;

    /// Release resources; errors are logged by the caller and otherwise ignored
    async fn on_cleanup(&self, _cancel: &CancellationToken) -> PluginResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let descriptor = PluginDescriptor::new("cache", "Response Cache", "1.0.0")
            .with_description("Caches read operations");

        assert_eq!(descriptor.id, "cache");
        assert_eq!(descriptor.name, "Response Cache");
        assert_eq!(descriptor.description, "Caches read operations");
    }

    #[test]
    fn test_state_defaults() {
        let state = PluginState::default();
        assert!(state.is_enabled());
        assert!(!state.is_initialized());

        state.set_enabled(false);
        state.mark_initialized();
        assert!(!state.is_enabled());
        assert!(state.is_initialized());

        state.mark_uninitialized();
        assert!(!state.is_initialized());
    }
}

//! Error types for the plugin framework
//!
//! Errors here describe failures of the framework itself: a plugin that cannot
//! initialize, a malformed registration, a disposed manager. Failures that
//! happen *while a plugin executes* are never surfaced as `Err` to the caller
//! of [`PluginManager::execute`](crate::PluginManager::execute); they are
//! folded into a failed [`ExecutionResult`](crate::ExecutionResult) instead.

use thiserror::Error;

/// Errors that can occur during plugin operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PluginError {
    /// Plugin initialization failed
    #[error("Plugin initialization failed: {message}")]
    Initialization { message: String },

    /// Plugin configuration is invalid
    #[error("Invalid plugin configuration: {message}")]
    Configuration { message: String },

    /// A request to the manager was rejected before any lifecycle call
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// Error raised by a plugin while executing
    #[error("Plugin execution error: {message}")]
    Execution { message: String },

    /// The manager has been disposed and no longer accepts plugins
    #[error("Plugin manager has already been disposed")]
    AlreadyDisposed,

    /// The operation observed a cancelled token
    #[error("Operation cancelled")]
    Cancelled,

    /// External system error
    #[error("External system error: {source}")]
    External {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PluginError {
    /// Create an initialization error
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

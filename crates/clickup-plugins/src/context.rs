//! Execution context passed to every plugin for one API operation

use crate::value::{FromValue, Value};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Handle to the API connection the calling service is about to use
///
/// Plugins never perform I/O through it; it is carried so plugins can
/// distinguish between connections (for example different workspaces or
/// tokens) when deriving keys or log fields.
pub trait ApiConnection: Send + Sync + fmt::Debug {
    /// Base URL of the API the connection talks to
    fn base_url(&self) -> &str;

    /// Stable identifier for the connection, e.g. a workspace or team id
    fn connection_id(&self) -> Option<&str> {
        None
    }
}

/// Context for one plugin chain invocation
///
/// Created by the calling service around a single API operation and dropped
/// afterwards. The connection is borrowed for the duration of the call.
#[derive(Debug)]
pub struct ExecutionContext<'a> {
    /// Connection the real call will go through
    pub connection: &'a dyn ApiConnection,

    /// Operation tag, e.g. `"GetTasks"` or `"CreateFolder"`
    pub operation_type: String,

    /// Service the operation belongs to, e.g. `"TaskService"`
    pub service_name: String,

    /// Parameters of the outgoing request
    pub request_data: HashMap<String, Value>,

    /// Values describing the response (or produced in place of one)
    pub response_data: HashMap<String, Value>,

    /// Anything else plugins want to share along the chain
    pub additional_data: HashMap<String, Value>,

    /// Context creation time
    pub created_at: DateTime<Utc>,
}

impl<'a> ExecutionContext<'a> {
    /// Create a new context with empty data maps
    pub fn new(
        connection: &'a dyn ApiConnection,
        service_name: impl Into<String>,
        operation_type: impl Into<String>,
    ) -> Self {
        Self {
            connection,
            operation_type: operation_type.into(),
            service_name: service_name.into(),
            request_data: HashMap::new(),
            response_data: HashMap::new(),
            additional_data: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder-style request parameter
    pub fn with_request(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request_data.insert(key.into(), value.into());
        self
    }

    /// Builder-style additional value
    pub fn with_additional(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_data.insert(key.into(), value.into());
        self
    }

    pub fn set_request(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.request_data.insert(key.into(), value.into());
    }

    pub fn set_response(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.response_data.insert(key.into(), value.into());
    }

    pub fn set_additional(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.additional_data.insert(key.into(), value.into());
    }

    /// Find `key` in request, response, then additional data
    #[must_use]
    pub fn find(&self, key: &str) -> Option<&Value> {
        self.request_data
            .get(key)
            .or_else(|| self.response_data.get(key))
            .or_else(|| self.additional_data.get(key))
    }

    /// Tiered typed lookup
    ///
    /// The first map containing `key` decides the outcome: if its value
    /// cannot be converted to `T` the lookup yields `None` rather than
    /// continuing to later maps.
    #[must_use]
    pub fn get_value<T: FromValue>(&self, key: &str) -> Option<T> {
        self.find(key).and_then(T::from_value)
    }

    /// Tiered typed lookup with a fallback
    #[must_use]
    pub fn get_value_or<T: FromValue>(&self, key: &str, default: T) -> T {
        self.get_value(key).unwrap_or(default)
    }

    /// `"{service}:{operation}"`, the key rate windows are tracked under
    #[must_use]
    pub fn operation_key(&self) -> String {
        format!("{}:{}", self.service_name, self.operation_type)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ApiConnection;

    #[derive(Debug)]
    pub(crate) struct TestConnection;

    impl ApiConnection for TestConnection {
        fn base_url(&self) -> &str {
            "https://api.clickup.test/api/v2"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestConnection;
    use super::*;

    #[test]
    fn test_context_creation() {
        let connection = TestConnection;
        let context = ExecutionContext::new(&connection, "TaskService", "GetTasks")
            .with_request("list_id", "901")
            .with_additional("trace", true);

        assert_eq!(context.operation_type, "GetTasks");
        assert_eq!(context.service_name, "TaskService");
        assert_eq!(context.operation_key(), "TaskService:GetTasks");
        assert_eq!(context.connection.base_url(), "https://api.clickup.test/api/v2");
        assert!(context.connection.connection_id().is_none());
        assert_eq!(context.get_value::<bool>("trace"), Some(true));
    }

    #[test]
    fn test_tiered_lookup_order() {
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "TaskService", "GetTasks");
        context.set_additional("page", 3);
        assert_eq!(context.get_value::<i64>("page"), Some(3));

        context.set_response("page", 2);
        assert_eq!(context.get_value::<i64>("page"), Some(2));

        context.set_request("page", 1);
        assert_eq!(context.get_value::<i64>("page"), Some(1));
    }

    #[test]
    fn test_conversion_and_default() {
        let connection = TestConnection;
        let mut context = ExecutionContext::new(&connection, "SpaceService", "GetSpaces");
        context.set_request("archived", "true");
        context.set_request("team", "not-a-number");

        assert_eq!(context.get_value::<bool>("archived"), Some(true));
        assert_eq!(context.get_value::<i64>("team"), None);
        assert_eq!(context.get_value_or("team", 7i64), 7);
        assert_eq!(context.get_value_or("missing", 9i64), 9);
    }
}

//! Receive configuration for a pipe's fetch cycle.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options governing how a pipe fetches messages for its step.
///
/// Changing the options on a running pipe takes effect on the next fetch
/// cycle; messages already buffered are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveOptions {
    /// The step (logical queue) to pull from.
    pub step: String,
    /// Maximum batch size per fetch. Forced to at least 1.
    pub count: u32,
    /// Acknowledge messages automatically on fetch.
    pub auto_ack: bool,
    /// Ask the server to block until messages are available.
    pub block: bool,
    /// How long a blocking fetch may wait server-side.
    pub timeout: Duration,
    /// How long the server withholds re-delivery of an unacknowledged,
    /// uncompleted message.
    pub redelivery_timeout: Duration,
    /// Omit routing information from fetched messages.
    pub exclude_routing: bool,
    /// Omit the route log from fetched messages.
    pub exclude_route_log: bool,
    /// Omit the decorated payload from fetched messages.
    pub exclude_decorated_payload: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            step: String::new(),
            count: 10,
            auto_ack: false,
            block: true,
            timeout: Duration::from_secs(5),
            redelivery_timeout: Duration::from_secs(60),
            exclude_routing: false,
            exclude_route_log: false,
            exclude_decorated_payload: false,
        }
    }
}

impl ReceiveOptions {
    /// Creates options for the given step with defaults.
    #[must_use]
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ..Self::default()
        }
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets auto-acknowledge on fetch.
    #[must_use]
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Sets server-side blocking.
    #[must_use]
    pub fn with_block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Sets the fetch timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the redelivery timeout.
    #[must_use]
    pub fn with_redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.redelivery_timeout = timeout;
        self
    }

    /// Sets the routing exclusion flag.
    #[must_use]
    pub fn with_exclude_routing(mut self, exclude: bool) -> Self {
        self.exclude_routing = exclude;
        self
    }

    /// Sets the route-log exclusion flag.
    #[must_use]
    pub fn with_exclude_route_log(mut self, exclude: bool) -> Self {
        self.exclude_route_log = exclude;
        self
    }

    /// Sets the decorated-payload exclusion flag.
    #[must_use]
    pub fn with_exclude_decorated_payload(mut self, exclude: bool) -> Self {
        self.exclude_decorated_payload = exclude;
        self
    }

    /// Normalizes the options for use by a pipe bound to `step`.
    ///
    /// The step field is forced to match the pipe and the count is forced to
    /// at least 1.
    #[must_use]
    pub fn normalized_for(mut self, step: &str) -> Self {
        self.step = step.to_string();
        self.count = self.count.max(1);
        self
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::retry::{BackoffConfig, RetryPolicy};

/// Settings shared by the three controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Workers per controller
    pub workers: usize,
    /// Full resync period; `None` disables it
    pub resync_interval_ms: Option<u64>,
    /// Retry budget for version-checked writes
    pub retry: RetryPolicy,
    /// Delay schedule for keys whose reconcile failed
    pub requeue_backoff: BackoffConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let controller = ControllerConfig::default();
        Self {
            workers: controller.workers,
            resync_interval_ms: Some(30_000),
            retry: RetryPolicy::default(),
            requeue_backoff: controller.requeue_backoff,
        }
    }
}

impl OperatorConfig {
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            resync_interval: self
                .resync_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            requeue_backoff: self.requeue_backoff.clone(),
        }
    }
}

/// Identity and write policy of an application using the client library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub namespace: String,
    /// Name of the request this instance owns
    pub identifier: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Uses the host name as identifier, or a random id if it has none.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            identifier: default_identifier(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }
}

const ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

fn default_identifier() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| nanoid::nanoid!(12, &ID_ALPHABET))
}

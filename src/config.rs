//! Per-attempt connection configuration.

use crate::retry::{RetryError, RetryPolicy};
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_RETRY_COUNT: u32 = 0;
const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_millis(2000);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Immutable configuration for one connection attempt.
///
/// Built once via [`ConnectionConfig::builder`] and shared by value into the
/// attempt; the retry policy it carries is a template from which each
/// attempt clones its own mutable instance.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    service: Option<Uuid>,
    secure: bool,
    can_interrupt_discovery: bool,
    retry_policy: RetryPolicy,
}

impl ConnectionConfig {
    /// Start building a configuration. All parameters have defaults: no
    /// service identifier, secure channel, discovery may be interrupted,
    /// no retries.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// The service identifier to connect to, if one was configured.
    pub fn service(&self) -> Option<Uuid> {
        self.service
    }

    /// Whether the connection must use a secure channel.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether an in-progress discovery scan may be interrupted to start
    /// the attempt immediately. When false the attempt waits for the scan
    /// to end.
    pub fn can_interrupt_discovery(&self) -> bool {
        self.can_interrupt_discovery
    }

    /// A fresh retry policy instance for one attempt.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        // The default parameters are all statically valid.
        ConnectionConfigBuilder::new()
            .build()
            .expect("default configuration is valid")
    }
}

/// Builder for [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    service: Option<Uuid>,
    secure: bool,
    can_interrupt_discovery: bool,
    retry_count: u32,
    initial_retry_delay: Duration,
    backoff_multiplier: f64,
}

impl ConnectionConfigBuilder {
    fn new() -> Self {
        Self {
            service: None,
            secure: true,
            can_interrupt_discovery: true,
            retry_count: DEFAULT_RETRY_COUNT,
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    /// Connect to a specific service on the peer. Without this the attempt
    /// falls back to the directory's suggestion for the device, then to
    /// [`crate::transport::FALLBACK_SERVICE_ID`].
    pub fn service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }

    /// Use a secure or insecure channel. Defaults to secure.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Allow or forbid interrupting a running discovery scan. Defaults to
    /// allowed.
    pub fn can_interrupt_discovery(mut self, can_interrupt: bool) -> Self {
        self.can_interrupt_discovery = can_interrupt;
        self
    }

    /// Maximum number of retries after the initial attempt fails.
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Delay before the first retry.
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Factor applied to the previous delay for each retry after the first.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Validate the parameters and produce the configuration.
    pub fn build(self) -> Result<ConnectionConfig, RetryError> {
        let retry_policy = RetryPolicy::new(
            self.retry_count,
            self.initial_retry_delay,
            self.backoff_multiplier,
        )?;
        Ok(ConnectionConfig {
            service: self.service,
            secure: self.secure,
            can_interrupt_discovery: self.can_interrupt_discovery,
            retry_policy,
        })
    }
}

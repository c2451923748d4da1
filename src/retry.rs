//! Retry logic with exponential backoff
//!
//! Errors are classified as transient or fatal through [`Classify`]. Transient
//! failures are retried according to a [`RetryPolicy`]; once attempts run out
//! the caller gets the last real error back unchanged.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::observability::metrics;

/// Machine-readable error codes understood by the retry classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ConnectionReset,
    NameNotFound,
    ConnectionRefused,
    TimedOut,
    HostUnreachable,
    NetworkUnreachable,
    ConnectionAborted,
    AuthenticationFailed,
    CommandFailed,
    NotConnected,
    Other,
}

impl ErrorCode {
    /// Map an I/O error kind onto a classifier code
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::ConnectionReset => ErrorCode::ConnectionReset,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => ErrorCode::ConnectionAborted,
            io::ErrorKind::TimedOut => ErrorCode::TimedOut,
            io::ErrorKind::HostUnreachable => ErrorCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ErrorCode::NetworkUnreachable,
            io::ErrorKind::NotConnected => ErrorCode::NotConnected,
            io::ErrorKind::PermissionDenied => ErrorCode::AuthenticationFailed,
            _ => ErrorCode::Other,
        }
    }

    /// Conventional errno-style name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionReset => "ECONNRESET",
            ErrorCode::NameNotFound => "ENOTFOUND",
            ErrorCode::ConnectionRefused => "ECONNREFUSED",
            ErrorCode::TimedOut => "ETIMEDOUT",
            ErrorCode::HostUnreachable => "EHOSTUNREACH",
            ErrorCode::NetworkUnreachable => "ENETUNREACH",
            ErrorCode::ConnectionAborted => "ECONNABORTED",
            ErrorCode::AuthenticationFailed => "EAUTH",
            ErrorCode::CommandFailed => "ECOMMAND",
            ErrorCode::NotConnected => "ENOTCONN",
            ErrorCode::Other => "EOTHER",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exposes what the classifier needs to know about an error
pub trait Classify {
    /// Machine-readable code, when the error carries one
    fn error_code(&self) -> Option<ErrorCode>;

    /// Human-readable message
    fn error_message(&self) -> String;
}

impl Classify for io::Error {
    fn error_code(&self) -> Option<ErrorCode> {
        match ErrorCode::from_io_kind(self.kind()) {
            ErrorCode::Other => None,
            code => Some(code),
        }
    }

    fn error_message(&self) -> String {
        self.to_string()
    }
}

/// Message fragments that mark an error as transient regardless of its code
pub const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "timeout",
    "network unreachable",
    "host unreachable",
    "temporary failure",
    "service unavailable",
    "socket hang up",
];

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Codes that are always retried
    pub retryable_codes: HashSet<ErrorCode>,
    /// Lowercase message fragments that are always retried
    pub retryable_messages: Vec<String>,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl RetryPolicy {
    /// Preset for reaching a remote machine: cheap to repeat
    pub fn connection() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_codes: [
                ErrorCode::ConnectionReset,
                ErrorCode::NameNotFound,
                ErrorCode::ConnectionRefused,
                ErrorCode::TimedOut,
                ErrorCode::HostUnreachable,
                ErrorCode::NetworkUnreachable,
                ErrorCode::ConnectionAborted,
            ]
            .into_iter()
            .collect(),
            retryable_messages: TRANSIENT_MESSAGE_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            jitter: false,
        }
    }

    /// Preset for repeating a whole transfer: expensive, so fewer and narrower retries
    pub fn whole_backup() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_codes: [
                ErrorCode::ConnectionReset,
                ErrorCode::TimedOut,
                ErrorCode::NetworkUnreachable,
            ]
            .into_iter()
            .collect(),
            retryable_messages: ["connection reset", "timeout", "network unreachable", "service unavailable"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            jitter: false,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::connection()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// First attempt plus retries
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sleep taken after failed attempt `attempt` (1-indexed), before the next one
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether an error is transient under this policy
    pub fn is_retryable<E: Classify + ?Sized>(&self, error: &E) -> bool {
        if let Some(code) = error.error_code() {
            if self.retryable_codes.contains(&code) {
                return true;
            }
        }
        let message = error.error_message().to_lowercase();
        self.retryable_messages
            .iter()
            .any(|fragment| message.contains(fragment.as_str()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
        delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}

/// Successful value together with the attempt that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempt: u32,
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    operation: &'static str,
}

impl RetryCoordinator {
    /// `operation` labels log lines and metrics
    pub fn new(operation: &'static str, policy: RetryPolicy) -> Self {
        Self { policy, operation }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.execute_with_attempts(operation)
            .await
            .map(|attempted| attempted.value)
    }

    /// Like [`execute`](Self::execute) but also reports which attempt succeeded
    pub async fn execute_with_attempts<F, Fut, T, E>(&self, mut operation: F) -> Result<Attempted<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let total_attempts = self.policy.total_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = self.operation,
                            attempt,
                            "Operation succeeded after retry"
                        );
                        metrics::record_retry(self.operation, "recovered");
                    }
                    return Ok(Attempted { value, attempt });
                }
                Err(error) => {
                    if !self.policy.is_retryable(&error) {
                        debug!(
                            operation = self.operation,
                            attempt,
                            error = %error,
                            "Error is not retryable"
                        );
                        metrics::record_retry(self.operation, "fatal");
                        return Err(error);
                    }

                    if attempt >= total_attempts {
                        warn!(
                            operation = self.operation,
                            attempts = attempt,
                            error = %error,
                            "Retry attempts exhausted"
                        );
                        metrics::record_retry(self.operation, "exhausted");
                        return Err(error);
                    }

                    let delay = self.policy.jittered(self.policy.delay_for_attempt(attempt));
                    warn!(
                        operation = self.operation,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    metrics::record_retry(self.operation, "retried");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Run `operation` under `policy` without keeping a coordinator around
pub async fn retry<F, Fut, T, E>(operation_name: &'static str, policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    RetryCoordinator::new(operation_name, policy.clone())
        .execute(operation)
        .await
}

//! Logging setup and Prometheus metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LoggingSettings};
pub use metrics::{gather_text, Timer};

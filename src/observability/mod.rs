//! Logging setup and request-level visibility.

pub mod logging;

pub use logging::{init_logging, request_log};

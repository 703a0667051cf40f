//! Shared helpers: logging setup, shutdown signals, time and error plumbing

pub mod error;
pub mod logging;
pub mod signal;
pub mod time;

pub use error::{log_error_async, result_to_option};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config};
pub use signal::{create_shutdown_receiver, wait_for_shutdown_signal};
pub use time::current_timestamp;

//! Configuration, paths, and logging for the outbox relay.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, LogConfig, LogFileWriter};
pub use paths::Paths;

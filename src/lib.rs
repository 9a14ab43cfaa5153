pub mod config;
pub mod error;
pub mod gelf;
pub mod record;
pub mod sink;
pub mod transport;
pub mod layer;

pub mod init;
pub mod noop_sink;

pub use config::{GelfConfig, Protocol, ProtocolOptions};
pub use error::{BuildError, ConfigError, InitError};
pub use record::LogRecord;
pub use sink::{exit_process_on_request, GelfSink, LogSink, ShutdownRequest};

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_gelf_sink::init::init_tracing;
use tracing_gelf_sink::{exit_process_on_request, GelfConfig, LogSink};

/// Ships events to a Graylog GELF TCP input.
///
/// Reads `GELF_*` environment variables, e.g.
/// `GELF_HOST=graylog.internal GELF_PROTOCOL=tls GELF_RECONNECT=-1`.
/// With `GELF_EXIT_ON_ERROR=true` the process exits shortly after the
/// exception below has been logged.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GelfConfig::from_env()?.with_custom_field("_app", "tcp_collector");
    let exit_on_error = config.exit_on_error;

    let sink = init_tracing(config)?;

    if exit_on_error {
        tokio::spawn(exit_process_on_request(Arc::clone(&sink)));
    }

    info!(user = "alice", "tcp collector example started");
    warn!(disk = "/dev/sda1", used_pct = 91.5, "disk almost full");
    error!(exception = true, "unrecoverable error\nstack trace would go here");

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    sink.cancel_shutdown();
    sink.shutdown().await;
    sink.closed().await;

    Ok(())
}

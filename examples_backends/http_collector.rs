use tracing::{error, info};
use tracing_gelf_sink::init::{init_tracing_with_config, LayerConfig};
use tracing_gelf_sink::{GelfConfig, LogSink};

/// Ships events to a Graylog GELF HTTP input at `http://127.0.0.1:12202/gelf`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GelfConfig {
        port: 12202,
        service: Some("http_collector".to_owned()),
        release: Some(env!("CARGO_PKG_VERSION").to_owned()),
        ..Default::default()
    }
    .with_protocol("http")?;
    config
        .protocol_options
        .headers
        .insert("x-graylog-source".to_owned(), "example".to_owned());

    let sink = init_tracing_with_config(config, LayerConfig { enable_stdout: false })?;

    info!(request_id = 42u64, "http collector example started");
    error!(db = "orders", "simulated error sent over HTTP");

    sink.shutdown().await;
    sink.closed().await;

    Ok(())
}

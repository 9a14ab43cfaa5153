use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use tracing_gelf_sink::layer::GelfLayer;
use tracing_gelf_sink::noop_sink::NoopSink;
use tracing_gelf_sink::{GelfConfig, GelfSink, LogSink};

const EVENTS: u64 = 100_000;

fn emit(label: &str) {
    let start = Instant::now();

    for i in 0..EVENTS {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!(
        "{}: sent {} events in {:?} (~{:.0} ev/s)",
        label,
        EVENTS,
        elapsed,
        EVENTS as f64 / elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    // Layer overhead alone
    let layer = GelfLayer::new(Arc::new(NoopSink));
    tracing::subscriber::with_default(Registry::default().with(layer), || emit("noop sink"));

    // Payload building plus TCP framing into a local collector that discards everything
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        if let Ok((mut conn, _)) = listener.accept().await {
            let mut buf = vec![0u8; 64 * 1024];
            while matches!(conn.read(&mut buf).await, Ok(n) if n > 0) {}
        }
    });

    let sink = Arc::new(
        GelfSink::new(GelfConfig {
            port,
            ..Default::default()
        })
        .expect("failed to build sink"),
    );
    let layer = GelfLayer::new(sink.clone());
    tracing::subscriber::with_default(Registry::default().with(layer), || emit("gelf over tcp"));

    // Give the driver a little time to drain its queue
    sleep(Duration::from_secs(2)).await;
    sink.shutdown().await;
    sink.closed().await;
}

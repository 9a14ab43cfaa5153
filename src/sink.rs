use crate::config::GelfConfig;
use crate::error::BuildError;
use crate::gelf::PayloadBuilder;
use crate::record::LogRecord;
use crate::transport::{build_transport, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Destination for [`LogRecord`]s produced by the logging layer.
///
/// `deliver` is called on the application thread for every forwarded event,
/// so implementations must hand the record off without blocking.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Hand a single record to the backend. Failures are never reported back.
    fn deliver(&self, record: &LogRecord);

    /// Stop accepting records and release the backend.
    ///
    /// Default implementation is a no-op.
    async fn shutdown(&self) {}
}

/// Raised by a [`GelfSink`] once an exception record has been delivered and
/// the exit delay has elapsed.
///
/// The sink never terminates the process itself; the host watches
/// [`GelfSink::shutdown_requested`] and decides what to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub exit_code: i32,
}

/// Ships records to a GELF collector.
pub struct GelfSink {
    name: String,
    builder: PayloadBuilder,
    transport: Arc<dyn Transport>,
    silent: bool,
    exit_on_error: bool,
    exit_delay: Duration,
    handle: Handle,
    pending_shutdown: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<watch::Sender<Option<ShutdownRequest>>>,
}

impl GelfSink {
    /// Build the sink and start its transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: GelfConfig) -> Result<Self, BuildError> {
        let transport = build_transport(&config)?;
        Self::with_transport(config, transport)
    }

    /// Build the sink on top of an already constructed transport.
    pub fn with_transport(
        config: GelfConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BuildError> {
        let handle = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
        let (shutdown, _) = watch::channel(None);

        info!(
            name = %config.name,
            host = %config.host,
            port = config.port,
            protocol = %config.protocol,
            "GELF sink started"
        );

        Ok(GelfSink {
            builder: PayloadBuilder::new(config.builder_config()),
            name: config.name.clone(),
            transport,
            silent: config.silent,
            exit_on_error: config.exit_on_error,
            exit_delay: config.exit_delay(),
            handle,
            pending_shutdown: Mutex::new(None),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn builder(&self) -> &PayloadBuilder {
        &self.builder
    }

    /// Deliver `record` and then call `done`.
    ///
    /// `done` runs synchronously once the payload has been handed to the
    /// transport, never after a remote acknowledgement.
    pub fn log<F>(&self, record: &LogRecord, done: F)
    where
        F: FnOnce(),
    {
        self.deliver(record);
        done();
    }

    /// Observe shutdown requests. The value is `None` until one is raised.
    pub fn shutdown_requested(&self) -> watch::Receiver<Option<ShutdownRequest>> {
        self.shutdown.subscribe()
    }

    /// Wait for a shutdown request.
    pub async fn wait_for_shutdown_request(&self) -> ShutdownRequest {
        let mut rx = self.shutdown.subscribe();
        loop {
            if let Some(request) = *rx.borrow_and_update() {
                return request;
            }

            // The sender outlives this borrow of `self`
            if rx.changed().await.is_err() {
                return ShutdownRequest { exit_code: 1 };
            }
        }
    }

    /// Abort a pending shutdown request. Returns `true` if one was pending.
    pub fn cancel_shutdown(&self) -> bool {
        let pending = self
            .pending_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match pending {
            Some(task) if !task.is_finished() => {
                task.abort();
                info!(name = %self.name, "Cancelled pending shutdown");
                true
            }
            _ => false,
        }
    }

    /// Wait until the transport has finished its background work.
    pub async fn closed(&self) {
        self.transport.closed().await;
    }

    fn schedule_shutdown(&self) {
        if self.shutdown.borrow().is_some() {
            return;
        }

        let mut pending = self
            .pending_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if pending.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(name = %self.name, "Shutdown already pending");
            return;
        }

        warn!(
            name = %self.name,
            delay_ms = self.exit_delay.as_millis() as u64,
            "Exception logged; requesting shutdown"
        );

        let delay = self.exit_delay;
        let transport = Arc::clone(&self.transport);
        let shutdown = Arc::clone(&self.shutdown);

        *pending = Some(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            transport.end();
            shutdown.send_replace(Some(ShutdownRequest { exit_code: 1 }));
        }));
    }
}

#[async_trait]
impl LogSink for GelfSink {
    fn deliver(&self, record: &LogRecord) {
        if self.silent {
            return;
        }

        let payload = self.builder.build(record);
        self.transport.send(Bytes::from(payload.to_bytes()));

        if record.exception && self.exit_on_error {
            self.schedule_shutdown();
        }
    }

    async fn shutdown(&self) {
        self.cancel_shutdown();
        self.transport.end();
        info!(name = %self.name, "GELF sink shut down");
    }
}

/// Exit the process with the requested status once `sink` raises a shutdown
/// request.
///
/// Spawn this on the runtime for the classic "log the crash, then die"
/// behavior.
pub async fn exit_process_on_request(sink: Arc<GelfSink>) {
    let request = sink.wait_for_shutdown_request().await;
    sink.closed().await;
    std::process::exit(request.exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{json, Value};
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Bytes>>,
        ended: Mutex<Option<Instant>>,
    }

    impl RecordingTransport {
        fn payloads(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|b| serde_json::from_slice(b).expect("payload isn't JSON"))
                .collect()
        }

        fn ended_at(&self) -> Option<Instant> {
            *self.ended.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn send(&self, msg: Bytes) {
            self.sent.lock().unwrap().push(msg);
        }

        fn end(&self) {
            self.ended.lock().unwrap().get_or_insert_with(Instant::now);
        }
    }

    fn sink(config: GelfConfig) -> (GelfSink, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let sink = GelfSink::with_transport(
            GelfConfig {
                hostname: Some("test-host".to_owned()),
                ..config
            },
            transport.clone(),
        )
        .expect("failed to build sink");

        (sink, transport)
    }

    fn crash() -> LogRecord {
        LogRecord::new("error", "boom\ndetail").with_exception(true)
    }

    #[tokio::test(start_paused = true)]
    async fn exception_requests_shutdown_after_delay() {
        let (sink, transport) = sink(GelfConfig {
            exit_on_error: true,
            exit_delay: 50,
            ..Default::default()
        });

        let start = Instant::now();
        sink.deliver(&crash());

        let payloads = transport.payloads();
        assert_eq!(1, payloads.len());
        assert_eq!(json!("boom"), payloads[0]["short_message"]);
        assert_eq!(json!(0), payloads[0]["level"]);
        assert_eq!(json!("test-host"), payloads[0]["host"]);

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(None, *sink.shutdown_requested().borrow());
        assert_eq!(None, transport.ended_at());

        let request = sink.wait_for_shutdown_request().await;
        assert_eq!(1, request.exit_code);

        let ended = transport.ended_at().expect("transport wasn't ended");
        assert!(ended.duration_since(start) >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn exceptions_ignored_unless_exit_on_error() {
        let (sink, transport) = sink(GelfConfig {
            exit_delay: 10,
            ..Default::default()
        });

        sink.deliver(&crash());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(1, transport.payloads().len());
        assert_eq!(None, *sink.shutdown_requested().borrow());
        assert_eq!(None, transport.ended_at());
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_shutdown_is_scheduled() {
        let (sink, transport) = sink(GelfConfig {
            exit_on_error: true,
            exit_delay: 50,
            ..Default::default()
        });

        let start = Instant::now();
        sink.deliver(&crash());
        tokio::time::sleep(Duration::from_millis(30)).await;
        sink.deliver(&crash());

        sink.wait_for_shutdown_request().await;

        // The second exception didn't push the deadline back
        let ended = transport.ended_at().expect("transport wasn't ended");
        assert!(ended.duration_since(start) < Duration::from_millis(80));
        assert_eq!(2, transport.payloads().len());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_shutdown_aborts_pending_request() {
        let (sink, transport) = sink(GelfConfig {
            exit_on_error: true,
            exit_delay: 50,
            ..Default::default()
        });

        sink.deliver(&crash());
        assert!(sink.cancel_shutdown());
        assert!(!sink.cancel_shutdown());

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(None, *sink.shutdown_requested().borrow());
        assert_eq!(None, transport.ended_at());
    }

    #[tokio::test]
    async fn silent_sink_sends_nothing_but_completes() {
        let (sink, transport) = sink(GelfConfig {
            silent: true,
            exit_on_error: true,
            ..Default::default()
        });

        let mut done = false;
        sink.log(&crash(), || done = true);

        assert!(done);
        assert!(transport.payloads().is_empty());
        assert!(!sink.cancel_shutdown());
    }

    #[tokio::test]
    async fn log_calls_done_after_send() {
        let (sink, transport) = sink(GelfConfig::default());

        let record = LogRecord::new("warn", "disk almost full").with_field("disk", "/dev/sda1");
        let mut sent_before_done = None;
        sink.log(&record, || sent_before_done = Some(transport.payloads().len()));

        assert_eq!(Some(1), sent_before_done);

        let payload = &transport.payloads()[0];
        assert_eq!(json!(1), payload["level"]);
        assert_eq!(json!("/dev/sda1"), payload["_disk"]);
        assert_eq!(json!("nodejs"), payload["_service"]);
    }

    #[tokio::test]
    async fn shutdown_ends_transport() {
        let (sink, transport) = sink(GelfConfig::default());

        sink.shutdown().await;
        sink.closed().await;

        assert!(transport.ended_at().is_some());
    }

    #[test]
    fn requires_a_runtime() {
        let transport = Arc::new(RecordingTransport::default());

        match GelfSink::with_transport(GelfConfig::default(), transport) {
            Err(BuildError::NoRuntime) => {}
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected a missing runtime error"),
        }
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sink = GelfSink::new(GelfConfig {
            port,
            hostname: Some("test-host".to_owned()),
            ..Default::default()
        })
        .expect("failed to build sink");

        sink.deliver(&LogRecord::new("info", "hello").with_field("user", 42));

        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.contains(&0) {
            let n = conn.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
        }

        let end = buf.iter().position(|b| *b == 0).unwrap();
        let payload: Value = serde_json::from_slice(&buf[..end]).unwrap();

        assert_eq!(json!("1.1"), payload["version"]);
        assert_eq!(json!("hello"), payload["short_message"]);
        assert_eq!(json!(2), payload["level"]);
        assert_eq!(json!(42), payload["_user"]);

        sink.shutdown().await;
        sink.closed().await;
    }
}

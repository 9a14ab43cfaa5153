//! GELF over a persistent TCP or TLS connection.
//!
//! Each message is framed by a trailing null byte; the collector splits the
//! stream on them. A background driver task owns the socket and feeds its
//! lifecycle events to a [`Supervisor`].

use crate::config::{GelfConfig, ReconnectPolicy};
use crate::error::BuildError;
use crate::transport::supervisor::{CloseAction, ConnectionState, Supervisor};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Sleep};
use tracing::{debug, info, warn};

#[cfg(feature = "tls")]
use crate::transport::tls::TlsSettings;

/// Settings for a [`StreamTransport`].
#[derive(Clone)]
pub struct StreamConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub policy: ReconnectPolicy,
    pub wait: Duration,
    pub keep_alive: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub nodelay: bool,
    #[cfg(feature = "tls")]
    tls: Option<TlsSettings>,
}

impl StreamConfig {
    /// Plain TCP settings with no reconnects, keepalive or idle timeout.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        StreamConfig {
            name: "gelf".to_owned(),
            host: host.into(),
            port,
            policy: ReconnectPolicy::Bounded(0),
            wait: Duration::from_millis(1000),
            keep_alive: None,
            idle_timeout: None,
            connect_timeout: Duration::from_secs(10),
            nodelay: false,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn from_config(config: &GelfConfig) -> Result<Self, BuildError> {
        let options = &config.protocol_options;

        let mut stream = StreamConfig::tcp(config.host.clone(), config.port);
        stream.name = config.name.clone();
        stream.policy = config.reconnect_policy();
        stream.wait = config.wait();
        stream.keep_alive = config.keep_alive();
        stream.idle_timeout = config.idle_timeout();
        stream.connect_timeout = options.connect_timeout();
        stream.nodelay = options.nodelay;

        if config.protocol.is_encrypted() {
            #[cfg(feature = "tls")]
            {
                stream.tls = Some(TlsSettings::new(&config.host, options.reject_unauthorized)?);
            }

            #[cfg(not(feature = "tls"))]
            {
                return Err(BuildError::TlsFeatureDisabled);
            }
        }

        Ok(stream)
    }

    fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }

        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    async fn connect(&self) -> io::Result<Box<dyn Connection>> {
        match time::timeout(self.connect_timeout, self.establish()).await {
            Ok(conn) => conn,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out connecting to {}:{}", self.host, self.port),
            )),
        }
    }

    async fn establish(&self) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.apply_socket_options(&stream)?;

        #[cfg(feature = "tls")]
        {
            if let Some(tls) = &self.tls {
                let stream = tls.connector.connect(tls.server_name.clone(), stream).await?;
                return Ok(Box::new(stream));
            }
        }

        Ok(Box::new(stream))
    }

    fn apply_socket_options(&self, stream: &TcpStream) -> io::Result<()> {
        if self.nodelay {
            stream.set_nodelay(true)?;
        }

        if let Some(time) = self.keep_alive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
        }

        Ok(())
    }
}

trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// GELF over TCP or TLS.
///
/// Messages handed over while a connection attempt is in progress are written
/// once it succeeds. Messages handed over while waiting to reconnect, or after
/// the transport has terminated, are dropped.
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    end: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
}

impl StreamTransport {
    /// Start connecting in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: StreamConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let driver = Driver {
            supervisor: Supervisor::new(config.policy, config.wait),
            config,
            rx,
            end: end_rx,
            state: state_tx,
        };

        tokio::spawn(driver.run());

        StreamTransport {
            tx,
            end: end_tx,
            state: state_rx,
        }
    }

    /// Observe the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn send(&self, msg: Bytes) {
        debug_assert!(!msg.contains(&0), "GELF messages can't contain null bytes");

        let mut frame = BytesMut::with_capacity(msg.len() + 1);
        frame.put_slice(&msg);
        frame.put_u8(b'\0');

        // The driver is gone once the transport has terminated
        let _ = self.tx.send(frame.freeze());
    }

    fn end(&self) {
        self.end.send_replace(true);
    }

    async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the driver has exited, which only happens once terminated
        let _ = state.wait_for(|s| *s == ConnectionState::Terminated).await;
    }
}

/// Owns the socket and drives the supervisor.
struct Driver {
    config: StreamConfig,
    supervisor: Supervisor,
    rx: mpsc::UnboundedReceiver<Bytes>,
    end: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
}

enum SessionEnd {
    Closed,
    Ended,
}

/// How much of the queue to write before closing an ended session.
#[derive(Clone, Copy)]
enum Flush {
    Queued,
    /// The socket is backed up; queued messages are dropped.
    Nothing,
}

type Writer = WriteHalf<Box<dyn Connection>>;

impl Driver {
    async fn run(mut self) {
        info!(
            name = %self.config.name,
            host = %self.config.host,
            port = self.config.port,
            tls = self.config.is_tls(),
            "Starting GELF stream transport"
        );

        loop {
            self.publish();

            let connected = tokio::select! {
                conn = self.config.connect() => Some(conn),
                _ = end_requested(&mut self.end) => None,
            };

            match connected {
                Some(Ok(conn)) => {
                    self.supervisor.on_connected();
                    self.publish();
                    info!(name = %self.config.name, "Connected to Graylog server");

                    if let SessionEnd::Ended = self.session(conn).await {
                        self.supervisor.end();
                    }
                }
                Some(Err(err)) => {
                    self.supervisor.on_error();
                    warn!(name = %self.config.name, error = %err, "Error connecting to Graylog");
                    self.drop_queued("connection attempt failed");
                }
                None => {
                    self.supervisor.end();
                    self.drop_queued("transport ended while connecting");
                }
            }

            match self.supervisor.on_close() {
                CloseAction::Reconnect(delay) => {
                    self.publish();
                    debug!(
                        name = %self.config.name,
                        attempt = self.supervisor.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );

                    if !self.wait_to_reconnect(delay).await {
                        self.supervisor.end();
                        break;
                    }

                    self.supervisor.on_reconnect_due();
                }
                CloseAction::Terminate => break,
            }
        }

        // Make sure the final state is observed even if the loop broke early
        let _ = self.supervisor.on_close();
        self.publish();
        self.drop_queued("transport terminated");

        info!(
            name = %self.config.name,
            errors = self.supervisor.errors(),
            "GELF stream transport terminated"
        );
    }

    async fn session(&mut self, conn: Box<dyn Connection>) -> SessionEnd {
        let (mut reader, mut writer) = tokio::io::split(conn);
        let mut buf = [0u8; 256];

        let idle_timeout = self.config.idle_timeout;
        let mut idle = idle_timeout.map(|timeout| Box::pin(time::sleep(timeout)));

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(frame) => {
                        // A collector that stops reading must not keep `end` waiting
                        let written = tokio::select! {
                            biased;
                            written = write_frame(&mut writer, &frame) => Some(written),
                            _ = end_requested(&mut self.end) => None,
                        };

                        match written {
                            Some(Ok(())) => {}
                            Some(Err(err)) => {
                                self.supervisor.on_error();
                                warn!(name = %self.config.name, error = %err, "Error writing to Graylog");
                                return SessionEnd::Closed;
                            }
                            None => return self.finish(writer, Flush::Nothing).await,
                        }
                    }
                    // Every handle to the transport is gone
                    None => return self.finish(writer, Flush::Nothing).await,
                },
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!(name = %self.config.name, "Disconnected from Graylog server");
                        return SessionEnd::Closed;
                    }
                    // The collector doesn't talk back; anything it sends is ignored
                    Ok(_) => {}
                    Err(err) => {
                        self.supervisor.on_error();
                        warn!(name = %self.config.name, error = %err, "Error reading from Graylog");
                        return SessionEnd::Closed;
                    }
                },
                _ = idle_elapsed(&mut idle) => {
                    if self.supervisor.on_timeout() {
                        self.publish();
                        debug!(name = %self.config.name, "Idle timeout; closing connection");
                        let _ = time::timeout(self.config.connect_timeout, writer.shutdown()).await;
                    }
                    return SessionEnd::Closed;
                }
                _ = end_requested(&mut self.end) => {
                    return self.finish(writer, Flush::Queued).await;
                }
            }

            if let (Some(sleep), Some(timeout)) = (idle.as_mut(), idle_timeout) {
                sleep.as_mut().reset(Instant::now() + timeout);
            }
        }
    }

    /// Close an ended session. Flushing and the socket shutdown together are
    /// bounded by the connect timeout.
    async fn finish(&mut self, mut writer: Writer, flush: Flush) -> SessionEnd {
        self.supervisor.end();
        self.publish();

        let grace = self.config.connect_timeout;
        let closed = time::timeout(grace, async {
            if let Flush::Queued = flush {
                self.flush_queued(&mut writer).await;
            }
            let _ = writer.shutdown().await;
        })
        .await;

        if closed.is_err() {
            warn!(
                name = %self.config.name,
                grace_ms = grace.as_millis() as u64,
                "Timed out closing connection to Graylog"
            );
        }

        self.drop_queued("transport ended");
        SessionEnd::Ended
    }

    /// Wait out the reconnect delay, dropping anything sent meanwhile.
    /// Returns `false` if the transport was ended while waiting.
    async fn wait_to_reconnect(&mut self, delay: Duration) -> bool {
        let wait = time::sleep(delay);
        tokio::pin!(wait);

        let mut dropped = 0u64;
        let reconnect = loop {
            tokio::select! {
                _ = &mut wait => break true,
                _ = end_requested(&mut self.end) => break false,
                msg = self.rx.recv() => match msg {
                    Some(_) => dropped += 1,
                    None => break false,
                },
            }
        };

        if dropped > 0 {
            debug!(name = %self.config.name, dropped, "Dropped messages while waiting to reconnect");
        }

        reconnect
    }

    async fn flush_queued(&mut self, writer: &mut Writer) {
        while let Ok(frame) = self.rx.try_recv() {
            if let Err(err) = write_frame(writer, &frame).await {
                warn!(name = %self.config.name, error = %err, "Error flushing to Graylog");
                self.drop_queued("flush failed");
                return;
            }
        }
    }

    fn drop_queued(&mut self, reason: &'static str) {
        let mut dropped = 0u64;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }

        if dropped > 0 {
            debug!(name = %self.config.name, dropped, reason, "Dropped queued messages");
        }
    }

    fn publish(&self) {
        let state = self.supervisor.state();
        let previous = self.state.send_replace(state);

        if previous != state {
            debug!(name = %self.config.name, from = %previous, to = %state, "Connection state changed");
        }
    }
}

async fn write_frame(writer: &mut Writer, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn idle_elapsed(idle: &mut Option<Pin<Box<Sleep>>>) {
    match idle {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn end_requested(end: &mut watch::Receiver<bool>) {
    // A dropped sender means the transport itself is gone
    let _ = end.wait_for(|ended| *ended).await;
}

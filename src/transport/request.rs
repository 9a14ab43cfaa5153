use crate::config::GelfConfig;
use crate::error::{BuildError, ConfigError};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Client;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// GELF over HTTP(S): one `POST` per message.
///
/// Requests run concurrently on the runtime the transport was built on. The
/// response status is logged but never retried.
pub struct RequestTransport {
    client: Client,
    url: String,
    headers: HeaderMap,
    tasks: TaskTracker,
    handle: Handle,
}

impl RequestTransport {
    pub fn new(config: &GelfConfig) -> Result<Self, BuildError> {
        let handle = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
        let options = &config.protocol_options;

        let client = Client::builder()
            .danger_accept_invalid_certs(!options.reject_unauthorized)
            .connect_timeout(options.connect_timeout())
            .tcp_keepalive(config.keep_alive())
            .tcp_nodelay(options.nodelay)
            .build()?;

        let scheme = if config.protocol.is_encrypted() {
            "https"
        } else {
            "http"
        };
        let url = format!("{}://{}:{}{}", scheme, config.host, config.port, options.path);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(&options.content_type)?);

        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            headers.insert(name, header_value(value)?);
        }

        debug!(name = %config.name, url = %url, "Built GELF request transport");

        Ok(RequestTransport {
            client,
            url,
            headers,
            tasks: TaskTracker::new(),
            handle,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(value.to_owned()))
}

#[async_trait]
impl Transport for RequestTransport {
    fn send(&self, msg: Bytes) {
        if self.tasks.is_closed() {
            debug!(url = %self.url, "Dropping message sent after the transport ended");
            return;
        }

        let mut headers = self.headers.clone();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(msg.len()));

        let request = self.client.post(&self.url).headers(headers).body(msg);
        let url = self.url.clone();

        self.tasks.spawn_on(
            async move {
                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            debug!(url = %url, status = %status, "Delivered GELF message");
                        } else {
                            warn!(url = %url, status = %status, "Graylog rejected GELF message");
                        }
                    }
                    Err(err) => warn!(url = %url, error = %err, "Error sending GELF message"),
                }
            },
            &self.handle,
        );
    }

    fn end(&self) {
        self.tasks.close();
    }

    async fn closed(&self) {
        self.tasks.wait().await;
    }
}

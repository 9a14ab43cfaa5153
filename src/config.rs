//! Construction-time configuration for [`GelfSink`](crate::sink::GelfSink).
//!
//! Every field is optional. [`GelfConfig::default`] matches the documented
//! defaults and [`GelfConfig::from_env`] overlays `GELF_*` environment
//! variables on top of them.

use crate::error::ConfigError;
use crate::gelf::{BuilderConfig, Sanitize};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variables read by [`GelfConfig::from_env`].
pub const GELF_HOST_ENV: &str = "GELF_HOST";
pub const GELF_PORT_ENV: &str = "GELF_PORT";
pub const GELF_PROTOCOL_ENV: &str = "GELF_PROTOCOL";
pub const GELF_RECONNECT_ENV: &str = "GELF_RECONNECT";
pub const GELF_WAIT_ENV: &str = "GELF_WAIT";
pub const GELF_KEEP_ALIVE_ENV: &str = "GELF_KEEP_ALIVE";
pub const GELF_TIMEOUT_ENV: &str = "GELF_TIMEOUT";
pub const GELF_EXIT_ON_ERROR_ENV: &str = "GELF_EXIT_ON_ERROR";
pub const GELF_EXIT_DELAY_ENV: &str = "GELF_EXIT_DELAY";
pub const GELF_SERVICE_ENV: &str = "GELF_SERVICE";
pub const GELF_ENVIRONMENT_ENV: &str = "GELF_ENVIRONMENT";
pub const GELF_RELEASE_ENV: &str = "GELF_RELEASE";
pub const GELF_SILENT_ENV: &str = "GELF_SILENT";
pub const GELF_LEGACY_FORMAT_ENV: &str = "GELF_LEGACY_FORMAT";
pub const GELF_DISABLE_MESSAGE_SANIFICATION_ENV: &str = "GELF_DISABLE_MESSAGE_SANIFICATION";

/// Wire transport used to reach the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Tls,
    Http,
    Https,
}

impl Protocol {
    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Tls)
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Https)
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "tls" => Ok(Protocol::Tls),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(ConfigError::UnknownProtocol(s.to_owned())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Http => "http",
            Protocol::Https => "https",
        })
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How many times the stream transport reconnects after losing its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Unlimited,
    Bounded(u32),
}

impl ReconnectPolicy {
    /// A negative bound means "retry forever".
    pub fn from_bound(bound: i64) -> Self {
        if bound < 0 {
            ReconnectPolicy::Unlimited
        } else {
            ReconnectPolicy::Bounded(u32::try_from(bound).unwrap_or(u32::MAX))
        }
    }

    pub fn allows(self, attempts: u32) -> bool {
        match self {
            ReconnectPolicy::Unlimited => true,
            ReconnectPolicy::Bounded(bound) => attempts < bound,
        }
    }
}

/// Options passed through to the underlying connection or HTTP request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolOptions {
    /// Verify the collector's certificate. Off by default so self-signed
    /// collectors work out of the box.
    pub reject_unauthorized: bool,
    pub connect_timeout_ms: u64,
    /// Set `TCP_NODELAY` on stream connections.
    pub nodelay: bool,
    /// HTTP endpoint path.
    pub path: String,
    pub content_type: String,
    /// Extra headers sent with every HTTP request.
    pub headers: BTreeMap<String, String>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        ProtocolOptions {
            reject_unauthorized: false,
            connect_timeout_ms: 10_000,
            nodelay: false,
            path: "/gelf".to_owned(),
            content_type: "application/json".to_owned(),
            headers: BTreeMap::new(),
        }
    }
}

impl ProtocolOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration for a [`GelfSink`](crate::sink::GelfSink).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GelfConfig {
    /// Name of this sink in diagnostics.
    pub name: String,
    /// Value of the payload's `host` field; the local hostname when unset.
    pub hostname: Option<String>,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Maximum reconnection attempts; negative means unlimited.
    pub reconnect: i64,
    /// Delay between reconnection attempts, in milliseconds.
    pub wait: u64,
    /// TCP keepalive probe interval in milliseconds; negative disables it.
    pub keep_alive: i64,
    /// Idle socket timeout in milliseconds.
    pub timeout: Option<u64>,
    pub exit_on_error: bool,
    /// Grace period before a shutdown is requested, in milliseconds.
    pub exit_delay: u64,
    /// Minimum level forwarded by the tracing layer.
    pub level: String,
    pub service: Option<String>,
    pub environment: Option<String>,
    pub release: Option<String>,
    pub silent: bool,
    pub disable_message_sanification: bool,
    pub legacy_format: bool,
    pub protocol_options: ProtocolOptions,
    /// Static fields added to every payload. Keys must begin with `_`.
    pub custom_fields: BTreeMap<String, Value>,
}

impl Default for GelfConfig {
    fn default() -> Self {
        GelfConfig {
            name: "gelf".to_owned(),
            hostname: None,
            host: "127.0.0.1".to_owned(),
            port: 12201,
            protocol: Protocol::Tcp,
            reconnect: 0,
            wait: 1000,
            keep_alive: 5000,
            timeout: None,
            exit_on_error: false,
            exit_delay: 2000,
            level: "info".to_owned(),
            service: Some("nodejs".to_owned()),
            environment: Some("development".to_owned()),
            release: None,
            silent: false,
            disable_message_sanification: false,
            legacy_format: false,
            protocol_options: ProtocolOptions::default(),
            custom_fields: BTreeMap::new(),
        }
    }
}

impl GelfConfig {
    /// Default configuration overlaid with any `GELF_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = GelfConfig::default();

        read_environment(&mut config.host, GELF_HOST_ENV)?;
        read_environment(&mut config.port, GELF_PORT_ENV)?;
        read_environment(&mut config.protocol, GELF_PROTOCOL_ENV)?;
        read_environment(&mut config.reconnect, GELF_RECONNECT_ENV)?;
        read_environment(&mut config.wait, GELF_WAIT_ENV)?;
        read_environment(&mut config.keep_alive, GELF_KEEP_ALIVE_ENV)?;
        read_optional(&mut config.timeout, GELF_TIMEOUT_ENV)?;
        read_flag(&mut config.exit_on_error, GELF_EXIT_ON_ERROR_ENV)?;
        read_environment(&mut config.exit_delay, GELF_EXIT_DELAY_ENV)?;
        read_optional(&mut config.service, GELF_SERVICE_ENV)?;
        read_optional(&mut config.environment, GELF_ENVIRONMENT_ENV)?;
        read_optional(&mut config.release, GELF_RELEASE_ENV)?;
        read_flag(&mut config.silent, GELF_SILENT_ENV)?;
        read_flag(&mut config.legacy_format, GELF_LEGACY_FORMAT_ENV)?;
        read_flag(
            &mut config.disable_message_sanification,
            GELF_DISABLE_MESSAGE_SANIFICATION_ENV,
        )?;

        Ok(config)
    }

    /// Parse and set the protocol from its string name.
    pub fn with_protocol(mut self, protocol: &str) -> Result<Self, ConfigError> {
        self.protocol = protocol.parse()?;
        Ok(self)
    }

    /// Add a static payload field. Keys not starting with `_` are kept but
    /// ignored when the sink is built.
    pub fn with_custom_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_fields.insert(key.into(), value.into());
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_bound(self.reconnect)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait)
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        u64::try_from(self.keep_alive)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn exit_delay(&self) -> Duration {
        Duration::from_millis(self.exit_delay)
    }

    /// Settings for the payload builder, resolving the local hostname if needed.
    pub fn builder_config(&self) -> BuilderConfig {
        let hostname = self.hostname.clone().unwrap_or_else(local_hostname);

        let custom_fields = self
            .custom_fields
            .iter()
            .filter(|(k, _)| {
                let reserved = k.starts_with('_');
                if !reserved {
                    tracing::warn!(field = %k, "ignoring custom field without a leading underscore");
                }
                reserved
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        BuilderConfig {
            hostname,
            service: self.service.clone(),
            environment: self.environment.clone(),
            release: self.release.clone(),
            legacy_format: self.legacy_format,
            sanitize: if self.disable_message_sanification {
                Sanitize::Passthrough
            } else {
                Sanitize::Stringify
            },
            custom_fields,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn read_environment<T>(into: &mut T, name: &str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(v) = read_var(name)? {
        *into = v;
    }

    Ok(())
}

fn read_optional<T>(into: &mut Option<T>, name: &str) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(v) = read_var(name)? {
        *into = Some(v);
    }

    Ok(())
}

fn read_flag(into: &mut bool, name: &str) -> Result<(), ConfigError> {
    if let Some(v) = read_var::<String>(name)? {
        *into = match v.as_str() {
            "True" | "true" | "1" => true,
            "False" | "false" | "0" => false,
            _ => {
                return Err(ConfigError::InvalidEnv {
                    name: name.to_owned(),
                    reason: format!("expected a boolean, got {:?}", v),
                })
            }
        };
    }

    Ok(())
}

fn read_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let invalid = |reason: String| ConfigError::InvalidEnv {
        name: name.to_owned(),
        reason,
    };

    match env::var(name) {
        // The environment variable exists, but is empty
        Ok(ref v) if v.is_empty() => Ok(None),
        // The environment variable does not exist
        Err(env::VarError::NotPresent) => Ok(None),
        // The environment variable is invalid
        Err(e) => Err(invalid(e.to_string())),
        Ok(v) => T::from_str(&v).map(Some).map_err(|e| invalid(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn defaults_match_documented_values() {
        let config = GelfConfig::default();

        assert_eq!("127.0.0.1", config.host);
        assert_eq!(12201, config.port);
        assert_eq!(Protocol::Tcp, config.protocol);
        assert_eq!(ReconnectPolicy::Bounded(0), config.reconnect_policy());
        assert_eq!(Duration::from_millis(1000), config.wait());
        assert_eq!(Some(Duration::from_millis(5000)), config.keep_alive());
        assert_eq!(None, config.idle_timeout());
        assert_eq!(Duration::from_millis(2000), config.exit_delay());
        assert!(!config.exit_on_error);
        assert!(!config.silent);
        assert_eq!(Some("nodejs"), config.service.as_deref());
        assert_eq!(Some("development"), config.environment.as_deref());
        assert_eq!(None, config.release);
    }

    #[test]
    fn parses_protocols() {
        assert_eq!(Protocol::Tcp, "tcp".parse().unwrap());
        assert_eq!(Protocol::Tls, "TLS".parse().unwrap());
        assert_eq!(Protocol::Http, "http".parse().unwrap());
        assert_eq!(Protocol::Https, "https".parse().unwrap());

        match "udp".parse::<Protocol>() {
            Err(ConfigError::UnknownProtocol(p)) => assert_eq!("udp", p),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn reconnect_policy_from_bound() {
        assert_eq!(ReconnectPolicy::Unlimited, ReconnectPolicy::from_bound(-1));
        assert_eq!(ReconnectPolicy::Bounded(3), ReconnectPolicy::from_bound(3));

        assert!(ReconnectPolicy::Unlimited.allows(u32::MAX));
        assert!(ReconnectPolicy::Bounded(2).allows(1));
        assert!(!ReconnectPolicy::Bounded(2).allows(2));
        assert!(!ReconnectPolicy::Bounded(0).allows(0));
    }

    #[test]
    fn non_positive_durations_disable_timers() {
        let config = GelfConfig {
            keep_alive: -1,
            timeout: Some(0),
            ..Default::default()
        };

        assert_eq!(None, config.keep_alive());
        assert_eq!(None, config.idle_timeout());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: GelfConfig = serde_json::from_value(json!({
            "host": "graylog.internal",
            "protocol": "https",
            "reconnect": -1,
            "keepAlive": 1000,
            "legacyFormat": true,
            "protocolOptions": { "rejectUnauthorized": true }
        }))
        .expect("failed to read config");

        assert_eq!("graylog.internal", config.host);
        assert_eq!(12201, config.port);
        assert_eq!(Protocol::Https, config.protocol);
        assert_eq!(ReconnectPolicy::Unlimited, config.reconnect_policy());
        assert!(config.legacy_format);
        assert!(config.protocol_options.reject_unauthorized);
        assert_eq!("/gelf", config.protocol_options.path);
    }

    #[test]
    fn rejects_unknown_protocol_in_config() {
        let result = serde_json::from_value::<GelfConfig>(json!({ "protocol": "udp" }));

        assert!(result.is_err());
    }

    #[test]
    fn custom_fields_require_underscore() {
        let config = GelfConfig {
            hostname: Some("box".to_owned()),
            ..Default::default()
        }
        .with_custom_field("_team", "core")
        .with_custom_field("team", "ignored");

        let builder = config.builder_config();

        assert_eq!("box", builder.hostname);
        assert_eq!(Some(&json!("core")), builder.custom_fields.get("_team"));
        assert!(!builder.custom_fields.contains_key("team"));
    }

    #[test]
    fn reads_environment_overrides() {
        env::set_var(GELF_HOST_ENV, "10.0.0.5");
        env::set_var(GELF_PROTOCOL_ENV, "tls");
        env::set_var(GELF_RECONNECT_ENV, "-1");
        env::set_var(GELF_SILENT_ENV, "True");
        env::set_var(GELF_RELEASE_ENV, "1.2.3");
        env::set_var(GELF_PORT_ENV, "");

        let config = GelfConfig::from_env().expect("failed to read env");

        assert_eq!("10.0.0.5", config.host);
        assert_eq!(Protocol::Tls, config.protocol);
        assert_eq!(-1, config.reconnect);
        assert!(config.silent);
        assert_eq!(Some("1.2.3"), config.release.as_deref());
        assert_eq!(12201, config.port);

        env::set_var(GELF_PORT_ENV, "not-a-port");
        assert!(GelfConfig::from_env().is_err());

        for name in [
            GELF_HOST_ENV,
            GELF_PROTOCOL_ENV,
            GELF_RECONNECT_ENV,
            GELF_SILENT_ENV,
            GELF_RELEASE_ENV,
            GELF_PORT_ENV,
        ] {
            env::remove_var(name);
        }
    }
}

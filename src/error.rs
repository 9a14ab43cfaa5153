/// Error type returned when reading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("protocol should be one of the following: tcp, tls, http or https (got {0:?})")]
    UnknownProtocol(String),

    #[error("environment variable {name} is invalid: {reason}")]
    InvalidEnv { name: String, reason: String },

    #[error("invalid HTTP header {0:?}")]
    InvalidHeader(String),
}

/// Error type returned when building a sink or transport from configuration.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("must be built from within a Tokio runtime")]
    NoRuntime,

    #[error("tls feature is not enabled")]
    TlsFeatureDisabled,

    #[cfg(feature = "tls")]
    #[error("failed to set up TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid collector host {0:?}")]
    InvalidHost(String),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Error type returned when installing the global subscriber.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

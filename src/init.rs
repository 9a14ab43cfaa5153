use crate::config::GelfConfig;
use crate::error::InitError;
use crate::layer::GelfLayer;
use crate::sink::GelfSink;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Options for the global subscriber installed by [`init_tracing_with_config`].
///
/// **Fields**
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt::Layer` is
///   stacked on top of [`GelfLayer`] so events are also printed locally.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
        }
    }
}

/// Build a [`GelfSink`] from `config` and install it as the global `tracing`
/// subscriber.
///
/// **Returns**
/// - The sink, so the host can watch for shutdown requests and shut it down
///   on exit.
/// - `Err(InitError::Build(..))` if the configuration is invalid or this
///   isn't called from within a Tokio runtime.
/// - `Err(InitError::AlreadyInstalled(..))` if a global subscriber exists.
pub fn init_tracing_with_config(
    config: GelfConfig,
    layer_config: LayerConfig,
) -> Result<Arc<GelfSink>, InitError> {
    let level = config.level.clone();
    let sink = Arc::new(GelfSink::new(config)?);
    let layer = GelfLayer::new(sink.clone()).with_level(&level);

    // The two stacks have different types, so install each on its own
    if layer_config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer();
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(sink)
}

/// Equivalent to [`init_tracing_with_config`] with [`LayerConfig::default`].
pub fn init_tracing(config: GelfConfig) -> Result<Arc<GelfSink>, InitError> {
    init_tracing_with_config(config, LayerConfig::default())
}

//! JSONL logging with per-peer context for Indras connection nodes
//!
//! Connection establishment runs many nodes in one process during tests and
//! simulations, so every log line needs to say whose it is. This crate wires
//! a `tracing` subscriber with JSONL output by default, optional rolling
//! files, and a [`PeerContextGuard`] that tags spans with the local peer.
//!
//! # Quick Start
//!
//! ```ignore
//! use indras_logging::{IndrasSubscriberBuilder, LogConfig};
//!
//! // JSONL to the console
//! let _guard = IndrasSubscriberBuilder::new().try_init()?;
//!
//! // Pretty output while developing
//! let _guard = IndrasSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .try_init()?;
//! ```
//!
//! # Peer Context
//!
//! ```ignore
//! use indras_logging::PeerContextGuard;
//!
//! let _guard = PeerContextGuard::new(&keypair.peer_id());
//! let span = tracing::info_span!("connect_chain");
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{PeerContextData, PeerContextGuard};
pub use layers::PeerContextLayer;

use std::fs::{self, File};
use std::str::FromStr;

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while setting up logging
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid logging configuration: {0}")]
    Config(String),

    #[error("Failed to open log file: {0}")]
    File(String),

    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Builder for configuring and initializing the Indras logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
pub struct IndrasSubscriberBuilder {
    config: LogConfig,
}

impl IndrasSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes the file writer when dropped and must be
    /// held for as long as file output is wanted.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LogError> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(self.config.directives())
                .map_err(|e| LogError::Config(e.to_string()))?,
        };

        let mut layers: Vec<BoxedLayer> = Vec::new();
        let mut guard = None;

        if self.config.console.enabled {
            layers.push(self.console_layer()?);
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            guard = Some(file_guard);
            layers.push(self.jsonl_layer(writer));
        }

        Registry::default()
            .with(layers)
            .with(PeerContextLayer::new())
            .with(env_filter)
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        Ok(guard)
    }

    fn console_layer(&self) -> Result<BoxedLayer, LogError> {
        let console = &self.config.console;
        let level = match &console.level {
            Some(level) => {
                LevelFilter::from_str(level).map_err(|e| LogError::Config(e.to_string()))?
            }
            None => LevelFilter::TRACE,
        };

        let layer = if console.pretty {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .with_filter(level)
                .boxed()
        } else {
            self.jsonl_layer(std::io::stdout)
                .with_filter(level)
                .boxed()
        };
        Ok(layer)
    }

    fn jsonl_layer<W>(&self, writer: W) -> BoxedLayer
    where
        W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
    {
        let jsonl = &self.config.jsonl;
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(jsonl.include_spans)
            .flatten_event(jsonl.flatten_events)
            .with_file(jsonl.include_location)
            .with_line_number(jsonl.include_location)
            .with_thread_ids(jsonl.include_thread_info)
            .with_thread_names(jsonl.include_thread_info)
            .with_writer(writer)
            .boxed()
    }
}

impl Default for IndrasSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Never truncates a single file; the others append through a rolling appender
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LogError> {
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            fs::create_dir_all(&config.directory).map_err(|e| LogError::File(e.to_string()))?;
            let path = config.directory.join(format!("{}.log", config.prefix));
            let file = File::create(&path).map_err(|e| LogError::File(e.to_string()))?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.clone())
        .filename_suffix("log");
    if let Some(max) = config.max_files {
        builder = builder.max_log_files(max);
    }
    let appender = builder
        .build(&config.directory)
        .map_err(|e| LogError::File(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging with default settings (JSONL to console)
pub fn init_default() -> Result<(), LogError> {
    IndrasSubscriberBuilder::new().try_init().map(|_| ())
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> Result<(), LogError> {
    IndrasSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .try_init()
        .map(|_| ())
}

/// Initialize logging for tests; later calls in the same process are no-ops
pub fn init_testing() {
    let _ = IndrasSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = IndrasSubscriberBuilder::new();
        assert_eq!(builder.config.default_level, "info");
        assert!(!builder.config.console.pretty); // JSONL by default
    }

    #[test]
    fn test_builder_with_config() {
        let builder = IndrasSubscriberBuilder::new().with_config(LogConfig::development());
        assert_eq!(builder.config.default_level, "debug");
        assert!(builder.config.console.pretty);
    }

    #[test]
    fn test_builder_setters() {
        let builder = IndrasSubscriberBuilder::new()
            .with_level("trace")
            .with_console(false);
        assert_eq!(builder.config.default_level, "trace");
        assert!(!builder.config.console.enabled);
    }

    #[test]
    fn test_bad_console_level() {
        let mut config = LogConfig::testing();
        config.console.level = Some("loud".into());
        let builder = IndrasSubscriberBuilder::new().with_config(config);
        assert!(matches!(builder.console_layer(), Err(LogError::Config(_))));
    }

    #[test]
    fn test_never_rotation_creates_file() {
        let dir = std::env::temp_dir().join(format!("indras-logging-{}", uuid::Uuid::new_v4()));
        let config = FileConfig {
            directory: dir.clone(),
            prefix: "node".into(),
            rotation: RotationStrategy::Never,
            max_files: None,
        };
        let (_writer, guard) = file_writer(&config).unwrap();
        drop(guard);
        assert!(dir.join("node.log").exists());
        let _ = fs::remove_dir_all(dir);
    }
}

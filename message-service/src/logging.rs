use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ParseLogFormatError(other.to_owned())),
        }
    }
}

/// Output format and filter directive, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Error, Debug)]
pub enum LogInitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the configured level.
pub fn init(config: &LogConfig) -> Result<(), LogInitError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let base_layer = fmt::layer().with_target(true).with_level(true);
    let log_layer = match config.format {
        LogFormat::Text => base_layer.with_filter(filter).boxed(),
        LogFormat::Json => base_layer.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry().with(log_layer).try_init()?;
    Ok(())
}

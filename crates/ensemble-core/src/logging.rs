use crate::{EnsembleError, EnsembleResult};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise `info`. Returns an
/// error if a global subscriber is already installed.
pub fn init(format: LogFormat) -> EnsembleResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| EnsembleError::Config(format!("Failed to initialise tracing: {e}")))
}

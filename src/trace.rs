//! Logging setup. `RUST_LOG` controls verbosity as usual; `--log-format`
//! switches between human-readable and JSON output for log-aggregator
//! ingestion, mirroring how the teacher's own binaries wire
//! `tracing_subscriber::fmt()`.

use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

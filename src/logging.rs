//! Tracing subscriber setup for the binary

use crate::config::LogFormat;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `level`; `verbose`
/// forces debug output for this crate.
pub fn init_logging(level: &str, verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("blockvault=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("blockvault={level}")))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

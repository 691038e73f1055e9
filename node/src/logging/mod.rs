//! Tracing subscriber setup.

use crate::cli::LogFormat;
use tracing_subscriber::EnvFilter;

/// Builds the filter used when `RUST_LOG` is not set.
pub fn verbosity_filter(verbosity: u8) -> EnvFilter {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        2 => ("info", "trace"),
        _ => ("debug", "trace"),
    };
    EnvFilter::new(format!("{global},chain_sync={local}"))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the verbosity-derived filter when present.
pub fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| verbosity_filter(verbosity));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(false)
            .with_env_filter(filter)
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::verbosity_filter;

    #[test]
    fn verbosity_maps_to_crate_level() {
        let quiet = verbosity_filter(0).to_string();
        assert!(quiet.contains("chain_sync=info"));
        assert!(quiet.contains("warn"));
        assert!(verbosity_filter(1).to_string().contains("chain_sync=debug"));
        let loud = verbosity_filter(7).to_string();
        assert!(loud.contains("chain_sync=trace"));
        assert!(loud.contains("debug"));
    }
}

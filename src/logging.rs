//! Tracing setup for binaries.
//!
//! `RUST_LOG` wins when set. Otherwise the level follows the verbosity flag:
//! `warn` by default, `debug` for this workspace's crates with `-v`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const VERBOSE_FILTER: &str = "warn,affinity_audit=debug,affinity_audit_core=debug";

/// Filter for the given verbosity, ignoring the environment.
pub fn default_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::new("warn")
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays parseable
/// under `--json`. Calling this twice is a no-op.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_filter_enables_debug() {
        assert!(default_filter(true).to_string().contains("affinity_audit_core=debug"));
        assert_eq!(default_filter(false).to_string(), "warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(false);
        init(true);
    }
}

//! Tracing setup for binaries and tests embedding the bridge.

use tracing_subscriber::EnvFilter;

/// Default directive applied on top of `RUST_LOG`
pub const DEFAULT_DIRECTIVE: &str = "nexus_event_bridge=debug";

/// Install a `fmt` subscriber filtered by `RUST_LOG` plus [`DEFAULT_DIRECTIVE`].
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    init_tracing_with(DEFAULT_DIRECTIVE)
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` plus `directive`.
pub fn init_tracing_with(directive: &str) -> bool {
    let mut filter = EnvFilter::from_default_env();
    match directive.parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => tracing::warn!(directive, error = %e, "Ignoring invalid log directive"),
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        assert!(!init_tracing_with("nexus_event_bridge=trace"));
    }
}

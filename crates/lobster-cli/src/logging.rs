use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Filter applied when `RUST_LOG` is unset: info from the lobster
/// crates, warnings from dependencies.
const DEFAULT_FILTER: &str = "lobster=info,warn";

/// Install the global tracing subscriber. Call once at startup.
///
/// Interactive commands log compact human-readable lines; `watch
/// --daemon` runs under a supervisor and logs JSON with targets so the
/// emitting loop is identifiable.
pub fn init(daemon: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let output = if daemon {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .without_time()
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(output).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}

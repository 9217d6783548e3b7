use tracing_subscriber::EnvFilter;

/// Directives used when neither `FERRY_LOG` nor `RUST_LOG` is set: the
/// queue core at `info`, dependencies only when they warn.
pub const DEFAULT_FILTER: &str = "warn,ferry_core=info";

/// `FERRY_LOG` wins over `RUST_LOG`, so an embedding application can keep
/// its own `RUST_LOG` and still tune the queue core separately.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("FERRY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global tracing subscriber: pretty output in debug builds,
/// JSON lines in release builds. Later calls leave the first subscriber in
/// place.
pub fn init_tracing() {
    let filter = env_filter();

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .try_init();
    }
}

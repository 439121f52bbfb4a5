//! Console logging setup.

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the filter passed to [`init`]
pub const LOG_ENV: &str = "SPIKENET_LOG";

/// Install a formatted console subscriber.
///
/// `level` is an `EnvFilter` directive such as `"info"` or
/// `"spikenet_connect=debug,warn"`. Calling this more than once is harmless;
/// only the first subscriber is kept.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init("warn");
        init("debug");
        tracing::warn!("logging initialised");
    }
}

use std::sync::Once;

use env_logger::{Builder, Env};

static INIT: Once = Once::new();

/// Install the process-wide logger. `RUST_LOG` overrides the default `info` level.
/// Safe to call more than once; only the first call has an effect.
pub fn setup_logging() {
    INIT.call_once(|| {
        let result = Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .try_init();
        if let Err(e) = result {
            eprintln!("Logger already installed: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        setup_logging();
        setup_logging();
        log::info!("logging ready");
    }
}

//! Logging setup for the daemon.

/// Default log directive; `RUST_LOG` overrides it.
const DEFAULT_DIRECTIVE: &str = "mapperd=info";

pub fn init() {
    #[cfg(all(feature = "tracing-subscriber", not(feature = "console-subscriber")))]
    {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

        // Scan progress and owner changes are info-level; surface them even
        // when the environment sets no filter.
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

        FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish()
            .init();
    }

    #[cfg(feature = "console-subscriber")]
    console_subscriber::init();
}

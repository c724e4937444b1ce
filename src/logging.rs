//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps optional trace output alive; flushes on drop.
pub struct LogGuard {
    #[cfg(feature = "chrome-trace")]
    _chrome: Option<tracing_chrome::FlushGuard>,
}

/// Filter directive for `-v` repetitions, falling back to `base`.
pub fn verbosity_filter(base: &str, verbose: u8) -> String {
    match verbose {
        0 => base.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `filter`.
///
/// With the `chrome-trace` feature and `PATHSTREAM_TRACE=1` spans are also
/// written to `trace.json`.
pub fn init_tracing(filter: &str) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false));

    #[cfg(feature = "chrome-trace")]
    {
        if std::env::var("PATHSTREAM_TRACE").ok().as_deref() == Some("1") {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file("trace.json")
                .build();
            if registry.with(chrome_layer).try_init().is_err() {
                return LogGuard { _chrome: None };
            }
            return LogGuard { _chrome: Some(guard) };
        }
        let _ = registry.try_init();
        LogGuard { _chrome: None }
    }

    #[cfg(not(feature = "chrome-trace"))]
    {
        let _ = registry.try_init();
        LogGuard {}
    }
}

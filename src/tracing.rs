//! Tracing (logging)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter applied when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "ncd_reduction=info";

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to
/// `default_filter` if not set.
///
/// # Arguments
///
/// * `default_filter`: Filter directives used when `RUST_LOG` is absent or invalid
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

pub mod codec;
pub mod config;
pub mod error;
pub mod listener;
pub mod lot;
pub mod merge;
pub mod pipeline;
pub mod store;

pub use error::*;

/// Install the fmt subscriber, filtered by `RUST_LOG` when set.
pub fn init_tracing(service: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    tracing::debug!(service, "tracing initialized");
}

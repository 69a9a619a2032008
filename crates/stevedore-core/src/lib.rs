pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod outputs;
pub mod runner;
pub mod runtime;
pub mod shapes;
pub mod store;
pub mod template;

pub use error::{Error, ErrorKind, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("stevedore tracing initialised");
}

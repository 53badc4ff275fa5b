#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod access;
pub mod cancel;
pub mod config;
mod error;
pub mod executor;
pub mod engine;
pub mod graph;
pub mod query;
pub mod rew;
mod utils;

use std::any::Any;
use std::sync::Arc;

pub use crate::error::*;

/// A type-erased value shared between threads, such as the output of a task
/// graph node.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Installs a global subscriber logging to stderr, with progress bars of
/// running task graphs rendered below the log.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Fails if a
/// global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

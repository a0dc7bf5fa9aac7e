//! Tracing subscriber setup for host binaries and examples.

use std::str::FromStr;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a console subscriber. `RUST_LOG` wins over `default_level`.
/// Returns an error if a global subscriber is already installed.
pub fn init(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()?;

    tracing::info!("logging initialized");
    Ok(())
}

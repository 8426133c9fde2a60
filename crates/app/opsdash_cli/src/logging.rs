use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::Error;

const DEFAULT_FILTER: &str = "info,opsdash_core=debug";

/// Logs go to stderr; stdout carries one JSON snapshot per line.
pub fn init() -> Result<(), Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => DEFAULT_FILTER.parse()?,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}

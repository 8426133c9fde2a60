// Import and re-export the `error` module
pub use self::error::{Error, Result};
mod error;

use clap::Parser;
use cli::{Cli, Commands};
use opsdash_core::auth::classify_url;

mod cli;
mod logging;
mod watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // No subscriber yet, so this one goes straight to stderr.
    if let Err(e) = logging::init() {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let args = Cli::parse();

    match args.command {
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        Commands::Classify { url } => {
            let label = if classify_url(&url).is_pending() {
                "recovery"
            } else {
                "none"
            };
            println!("{label}");
        }
        Commands::Watch(watch_args) => watch::run(watch_args).await?,
    }

    Ok(())
}

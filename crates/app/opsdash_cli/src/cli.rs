use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "opsdash", version, about = "Opsdash session controller CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the CLI name and version.
    Version,

    /// Report whether a page URL is a recovery / invite entry.
    Classify {
        /// Absolute URL or `path?query#fragment`.
        url: String,
    },

    /// Run the session controller against the backend and print snapshots.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Page URL the dashboard was opened with (e.g. a recovery link).
    #[arg(long)]
    pub url: Option<String>,

    /// Sign in with email and password before starting.
    #[arg(long, env = "OPSDASH_EMAIL", requires = "password")]
    pub email: Option<String>,

    #[arg(long, env = "OPSDASH_PASSWORD", requires = "email", hide_env_values = true)]
    pub password: Option<String>,

    /// Password to set when the controller asks for one.
    #[arg(long, hide_env_values = true)]
    pub new_password: Option<String>,

    /// Exit after the first settled snapshot.
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Sign out at the backend before exiting.
    #[arg(long, default_value_t = false)]
    pub sign_out_on_exit: bool,
}

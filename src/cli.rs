use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "streamgrab",
    about = "Scrapes event schedules and PPV catalogs into schedule JSON and M3U playlists"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "streamgrab.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Fetch the schedule page (and the 24/7 channel page) into schedule JSON
    Schedule,

    /// Resolve the PPV catalog into an M3U playlist
    Catalog,

    /// Convert a saved schedule page without touching the network
    Extract {
        /// HTML file to read
        input: PathBuf,

        /// Write JSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run every enabled stage (default)
    All,
}

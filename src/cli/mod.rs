use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "🖥️ Remote-control link over a single TCP stream", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controlled endpoint: wait for a controller and obey it
    Agent {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:9999")]
        bind: String,

        /// Directory for received files (defaults to the desktop)
        #[arg(short, long)]
        downloads: Option<PathBuf>,
    },

    /// Connect to an agent and open the interactive console
    Connect {
        /// Agent address
        #[arg(default_value = "127.0.0.1:9999")]
        addr: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

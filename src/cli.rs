//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// Fleet Console - admin control plane for fleets of server processes
///
/// Run one `master` per fleet and one `monitor` inside (or beside) every
/// server process; admin clients connect to the master to query modules
/// and switch them on or off.
#[derive(Parser, Debug)]
#[command(name = "fleet-console")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the master (accepts monitors and admin clients)
    Master {
        /// Path to configuration file
        #[arg(short, long, env = "FLEET_CONFIG")]
        config: Option<String>,

        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a monitor that registers with the master
    Monitor {
        /// Path to configuration file
        #[arg(short, long, env = "FLEET_CONFIG")]
        config: Option<String>,

        /// Server id to register as
        #[arg(long)]
        id: Option<String>,

        /// Declared server type
        #[arg(long)]
        server_type: Option<String>,

        /// Master WebSocket URL (ws:// or wss://)
        #[arg(long)]
        master_url: Option<String>,
    },

    /// Display version and build information
    Version {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Write a commented default configuration file
    Init {
        /// Where to create the file (default ~/.fleet/console.toml)
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

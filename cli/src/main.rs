//! homedb CLI: run the daemon or talk to a running one.
//!
//! # Usage
//!
//! ```text
//! homedb serve
//! homedb mk / kitchen --kind room
//! homedb ls /
//! homedb query "room > light" --attr on=1
//! homedb watch "/room/*/color/value"
//! homedb stop
//! ```

mod commands;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use homedb_core::config::{resolve_config_dir, Settings};
use homedb_core::transport::Endpoint;


#[derive(Parser)]
#[command(name = "homedb")]
#[command(about = "Shared home-automation namespace daemon and client")]
struct Cli {
    /// Config directory (default: $HOMEDB_CONFIG_DIR or ~/.config/homedb)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Override the endpoint (unix:PATH or tcp:HOST:PORT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Debug logging for homedb itself
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}


#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Ask a running daemon to stop
    Stop,

    /// List the children of a node
    Ls { path: String },

    /// Create a node
    Mk {
        parent: String,
        name: String,
        /// Node kind (default: node)
        #[arg(long)]
        kind: Option<String>,
    },

    /// Remove a childless node
    Rm { parent: String, name: String },

    /// Show one node
    Get { path: String },

    /// Run a selector query.
    ///
    /// Transforms apply in this order: --parent, --children, --empty,
    /// then each --attr, then each --css.
    Query {
        selector: String,
        /// Read (NAME) or write (NAME=VALUE) an attribute
        #[arg(long = "attr", value_name = "NAME[=VALUE]")]
        attrs: Vec<String>,
        /// Read (NAME) or write (NAME=VALUE) a style property
        #[arg(long = "css", value_name = "NAME[=VALUE]")]
        css: Vec<String>,
        /// Move to the parents of the matches
        #[arg(long)]
        parent: bool,
        /// Move to the children of the matches
        #[arg(long)]
        children: bool,
        /// Remove every descendant of the matches
        #[arg(long)]
        empty: bool,
    },

    /// Print pushes for a path pattern or selector until interrupted
    Watch { target: String },
}


fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_dir = cli.config_dir.clone().unwrap_or_else(resolve_config_dir);
    let mut settings = match Settings::load(&config_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("homedb: {}", e);
            process::exit(1);
        }
    };
    if let Some(endpoint) = &cli.endpoint {
        match endpoint.parse::<Endpoint>() {
            Ok(ep) => {
                settings.server.endpoint = Some(ep);
                settings.client.endpoint = settings.server.endpoint.clone();
            }
            Err(e) => {
                eprintln!("homedb: {}", e);
                process::exit(2);
            }
        }
    }

    if let Err(e) = commands::run(cli.command, &settings) {
        eprintln!("homedb: {:#}", e);
        process::exit(1);
    }
}


fn init_logging(verbose: bool) {
    let default = if verbose { "info,homedb_core=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

//! tasksync: command-line client for the real-time task sync channel.
//!
//! ## Subcommands
//!
//! - `watch`: Keep a task list in sync and print it after every change
//! - `ping`: Check that a broker answers
//! - `device-id`: Print this session's device id
//! - `config`: Print the effective configuration

mod identity;
mod logging;
mod ping;
mod watch;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tasksync_core::load_config;

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Real-time task sync client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a task list and print it as JSON after every change
    Watch {
        /// User whose task stream to join
        #[arg(long)]
        user: String,

        /// Broker endpoint (overrides config and TASKSYNC_ENDPOINT)
        #[arg(long)]
        endpoint: Option<String>,

        /// Config file (default: ~/.tasksync/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON array of tasks to seed the collection with
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Skip change events that originated from this device
        #[arg(long)]
        ignore_self: bool,

        /// Session name used to keep the device id stable across runs
        #[arg(long)]
        session: Option<String>,

        /// Exit after this many applied changes
        #[arg(long)]
        max_events: Option<u64>,
    },

    /// Connect, send a ping and wait for the pong
    Ping {
        #[arg(long)]
        user: String,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },

    /// Print the device id for this session
    DeviceId {
        #[arg(long)]
        session: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            user,
            endpoint,
            config,
            snapshot,
            ignore_self,
            session,
            max_events,
        } => {
            let options = watch::WatchOptions {
                user,
                endpoint,
                config,
                snapshot,
                ignore_self,
                session,
                max_events,
            };
            if let Err(e) = watch::run(&options) {
                tracing::error!(error = %e, "tasksync watch failed");
                std::process::exit(1);
            }
        }
        Commands::Ping {
            user,
            endpoint,
            config,
            timeout_ms,
        } => {
            let options = ping::PingOptions {
                user,
                endpoint,
                config,
                timeout_ms,
            };
            match ping::run(&options) {
                Ok(rtt) => println!("pong in {} ms", rtt.as_millis()),
                Err(e) => {
                    tracing::error!(error = %e, "tasksync ping failed");
                    std::process::exit(1);
                }
            }
        }
        Commands::DeviceId { session } => {
            println!("{}", identity::resolve_device_id(session.as_deref()));
        }
        Commands::Config { config } => {
            match load_config(config.as_deref()).and_then(|config| config.to_toml()) {
                Ok(text) => print!("{}", text),
                Err(e) => {
                    tracing::error!(error = %e, "tasksync config failed");
                    std::process::exit(1);
                }
            }
        }
    }
}

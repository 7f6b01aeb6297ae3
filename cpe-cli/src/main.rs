//! CPE CLI - Command-line interface
//!
//! Runs a collection through the pipeline described by a CPE descriptor, and
//! hosts stage instances for fenced deployments.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cpe::config::WORKER_SUBCOMMAND;
use cpe::logging::default_log_dir;

use commands::run::RunArgs;
use commands::worker::{parse_param, WorkerArgs};

#[derive(Parser)]
#[command(name = "cpe")]
#[command(about = "Collection processing engine", long_about = None)]
#[command(version = cpe::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a collection described by a CPE descriptor
    Run {
        /// Path to the descriptor (INI)
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Directory for the log file
        #[arg(long, default_value = default_log_dir())]
        log_dir: PathBuf,

        /// Resume from a checkpoint written by an earlier run
        #[arg(long)]
        restore: Option<PathBuf>,

        /// Override the number of pipelines
        #[arg(long)]
        pipelines: Option<usize>,

        /// Stop after reading this many entities (0 = no limit)
        #[arg(long)]
        entity_limit: Option<u64>,
    },

    /// Serve one stage type over the fenced worker protocol
    #[command(name = WORKER_SUBCOMMAND)]
    Worker {
        /// Registered processor component to host
        #[arg(long)]
        component: String,

        /// Address to listen on; port 0 picks a free port
        #[arg(long, default_value = "127.0.0.1:0")]
        listen: String,

        /// Component parameter as key=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            log_dir,
            restore,
            pipelines,
            entity_limit,
        } => commands::run::run(RunArgs {
            descriptor: config,
            log_dir,
            restore,
            pipelines,
            entity_limit,
        }),
        Commands::Worker {
            component,
            listen,
            params,
        } => commands::worker::run(WorkerArgs {
            component,
            listen,
            params,
        }),
    };

    if let Err(e) = result {
        e.exit();
    }
}

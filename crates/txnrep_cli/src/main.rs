//! txnrep CLI
//!
//! Command-line tools that drive an in-memory replicator.
//!
//! # Commands
//!
//! - `simulate` - Run concurrent transactions against a primary
//! - `lifecycle` - Walk a replica through open, role changes and close
//! - `versions` - Show readers blocking and releasing version removal

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use txnrep_core::ReplicaRole;

/// txnrep replicator tools.
#[derive(Parser)]
#[command(name = "txnrep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent transactions against an in-memory primary
    Simulate {
        /// Number of transactions to commit
        #[arg(short, long, default_value = "1000")]
        transactions: usize,

        /// Number of concurrent tasks
        #[arg(long, default_value = "4")]
        tasks: usize,

        /// Operations per transaction
        #[arg(short, long, default_value = "2")]
        operations: usize,

        /// Retriable log failures to inject before the first commit
        #[arg(short, long, default_value = "0")]
        failures: usize,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Walk a replica through open, primary, secondary, none and close
    Lifecycle {
        /// Make the state manager fail when changing to this role
        #[arg(long, value_enum)]
        fail_at: Option<RoleArg>,

        /// Print the steps as JSON
        #[arg(long)]
        json: bool,
    },

    /// Register readers and show version removal blocking on them
    Versions {
        /// Number of readers to register
        #[arg(short, long, default_value = "3")]
        readers: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version information
    Version,
}

/// Role a failure can be injected at.
#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Primary,
    ActiveSecondary,
    None,
}

impl From<RoleArg> for ReplicaRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Primary => ReplicaRole::Primary,
            RoleArg::ActiveSecondary => ReplicaRole::ActiveSecondary,
            RoleArg::None => ReplicaRole::None,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Simulate {
            transactions,
            tasks,
            operations,
            failures,
            json,
        } => {
            let options = commands::simulate::SimulateOptions {
                transactions,
                tasks,
                operations,
                failures,
            };
            runtime.block_on(commands::simulate::run(&options, json))?;
        }
        Commands::Lifecycle { fail_at, json } => {
            runtime.block_on(commands::lifecycle::run(fail_at.map(Into::into), json))?;
        }
        Commands::Versions { readers, json } => {
            runtime.block_on(commands::versions::run(readers, json))?;
        }
        Commands::Version => {
            println!("txnrep CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

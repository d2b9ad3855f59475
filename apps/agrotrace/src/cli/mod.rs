//! # AgroTrace CLI Module
//!
//! This module implements the CLI interface for AgroTrace.
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server and calculation worker
//! - `init` - Initialize a new database
//! - `status` - Show store counts
//! - `factors import|list|resolve` - Emission factor administration
//! - `summary` - Show a user's carbon summary
//! - `events` - List a VTI's events
//! - `pending` - List calculations awaiting a transport model
//! - `recalculate` - Replay ledger events that never produced a record

mod commands;

use agrotrace::config::Config;
use agrotrace_core::TraceError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// AgroTrace - Traceability Registry & Carbon Accounting Engine
///
/// Records the provenance of agricultural products and the carbon
/// footprint of the activities that produced them.
#[derive(Parser, Debug)]
#[command(name = "agrotrace")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the ledger database
    #[arg(short = 'D', long, global = true, default_value = "agrotrace.db")]
    pub database: PathBuf,

    /// Storage backend: "redb" (ACID database) or "memory" (volatile)
    #[arg(short = 'B', long, global = true, default_value = "redb")]
    pub backend: String,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to (overrides [server].host)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Show store counts
    Status,

    /// Emission factor administration
    Factors {
        #[command(subcommand)]
        action: FactorCommands,
    },

    /// Show a user's carbon footprint summary
    Summary {
        /// User VTI id
        #[arg(short, long)]
        user: String,

        /// Window: month, quarter or year
        #[arg(short, long, default_value = "month")]
        period: String,
    },

    /// List a VTI's events in event-time order
    Events {
        /// VTI id
        #[arg(long)]
        vti: String,

        /// Maximum number of events
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// List calculations awaiting a transport model
    Pending,

    /// Recalculate ledger events that have no record or pending marker
    Recalculate,
}

/// Emission factor subcommands.
#[derive(Subcommand, Debug)]
pub enum FactorCommands {
    /// Import factors from a JSON array
    Import {
        /// Path to the JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List all factors
    List,

    /// Show the factor that would be used for a key
    Resolve {
        /// Region (falls back to Global)
        #[arg(short, long, default_value = "Global")]
        region: String,

        /// Activity type
        #[arg(short, long, default_value = "INPUT_APPLIED")]
        activity: String,

        /// Input type (e.g. urea)
        #[arg(short, long)]
        input: Option<String>,

        /// Factor type (e.g. kg)
        #[arg(short = 't', long)]
        factor_type: Option<String>,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), TraceError> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    let backend = cli.backend.as_str();
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server { host, port }) => {
            cmd_server(&cli.database, backend, config, host, port).await
        }
        Some(Commands::Init { force }) => cmd_init(&cli.database, backend, force),
        Some(Commands::Status) => cmd_status(&cli.database, backend, json_mode),
        Some(Commands::Factors { action }) => match action {
            FactorCommands::Import { file } => {
                cmd_factors_import(&cli.database, backend, json_mode, &file)
            }
            FactorCommands::List => cmd_factors_list(&cli.database, backend, json_mode),
            FactorCommands::Resolve {
                region,
                activity,
                input,
                factor_type,
            } => cmd_factors_resolve(
                &cli.database,
                backend,
                json_mode,
                &config,
                &region,
                &activity,
                input,
                factor_type,
            ),
        },
        Some(Commands::Summary { user, period }) => {
            cmd_summary(&cli.database, backend, json_mode, &user, &period)
        }
        Some(Commands::Events { vti, limit }) => {
            cmd_events(&cli.database, backend, json_mode, &vti, limit)
        }
        Some(Commands::Pending) => cmd_pending(&cli.database, backend, json_mode),
        Some(Commands::Recalculate) => {
            cmd_recalculate(&cli.database, backend, json_mode, config).await
        }
        None => cmd_status(&cli.database, backend, json_mode),
    }
}

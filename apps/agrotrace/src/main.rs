//! # AgroTrace - Traceability Registry & Carbon Accounting Engine
//!
//! The main binary for the AgroTrace ledger.
//!
//! This application provides:
//! - HTTP REST API server (axum-based)
//! - CLI interface for ledger administration
//! - Background worker turning appended events into carbon records
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  apps/agrotrace (THE BINARY)                 │
//! │                                                              │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐  │
//! │  │   CLI       │    │   HTTP API  │    │ Trigger Worker  │  │
//! │  │  (clap)     │    │   (axum)    │    │ (tokio mpsc)    │  │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬────────┘  │
//! │         │                  │                    │           │
//! │         └──────────────────┼────────────────────┘           │
//! │                            ▼                                │
//! │                  ┌──────────────────┐                       │
//! │                  │  agrotrace-core  │                       │
//! │                  │   (THE LEDGER)   │                       │
//! │                  └──────────────────┘                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! agrotrace server --host 0.0.0.0 --port 8080 --config agrotrace.toml
//!
//! # CLI operations
//! agrotrace status
//! agrotrace factors import -f factors.json
//! agrotrace summary --user farmer-1 --period quarter
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // AGROTRACE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("AGROTRACE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "agrotrace=debug,agrotrace_core=debug,tower_http=debug"
    } else {
        "agrotrace=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the AgroTrace startup banner.
fn print_banner() {
    println!(
        r#"
   _                 _____
  /_\  __ _ _ _ ___ |_   _| _ __ _ __ ___
 / _ \/ _` | '_/ _ \  | || '_/ _` / _/ -_)
/_/ \_\__, |_| \___/  |_||_| \__,_\__\___|
      |___/

  Traceability Registry & Carbon Accounting v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}

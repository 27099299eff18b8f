//! Ramp - operator CLI for the rollout daemon
//!
//! Thin client over the Unix socket protocol: every subcommand maps to
//! one request, and the daemon's JSON response is printed as-is.

#![forbid(unsafe_code)]

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ramp_common::protocol::Request;
use ramp_common::types::Stage;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ramp")]
#[command(author, version, about = "Ramp CLI - control progressive flag rollouts")]
struct Cli {
    /// Path to the daemon's Unix socket
    #[arg(short, long, env = "RAMP_SOCKET", default_value = "/tmp/rampd.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a flag in the disabled stage
    Create {
        flag: String,
        /// Environment scope (defaults to the daemon's environment)
        #[arg(long)]
        environment: Option<String>,
    },
    /// Manually move a flag to a stage (canary, ramping, full,
    /// rolled_back, disabled)
    Stage { flag: String, stage: Stage },
    /// Raise the rollout percentage within ramping
    Percentage { flag: String, percentage: u8 },
    /// Replace the allow/deny lists
    Lists {
        flag: String,
        /// Comma-separated subjects always included
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,
        /// Comma-separated subjects always excluded
        #[arg(long, value_delimiter = ',')]
        deny: Vec<String>,
    },
    /// Archive a flag (permanently disabled, kept for audit)
    Archive { flag: String },
    /// Evaluate a flag for a subject
    Evaluate { flag: String, subject: String },
    /// Show one flag definition
    Get { flag: String },
    /// List flag definitions
    List {
        #[arg(long)]
        environment: Option<String>,
    },
    /// Show the transition history of a flag
    History {
        flag: String,
        /// Only records at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
        /// Only records at or before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<String>,
    },
    /// Daemon status summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let request = build_request(cli.command)?;
    let response = commands::send_request(&cli.socket, &request).await?;
    commands::render_response(&response)
}

fn build_request(command: Command) -> Result<Request> {
    Ok(match command {
        Command::Create { flag, environment } => Request::CreateFlag { flag, environment },
        Command::Stage { flag, stage } => Request::SetStage { flag, stage },
        Command::Percentage { flag, percentage } => Request::SetPercentage { flag, percentage },
        Command::Lists { flag, allow, deny } => Request::SetLists { flag, allow, deny },
        Command::Archive { flag } => Request::ArchiveFlag { flag },
        Command::Evaluate { flag, subject } => Request::Evaluate { flag, subject },
        Command::Get { flag } => Request::GetFlag { flag },
        Command::List { environment } => Request::ListFlags { environment },
        Command::History { flag, since, until } => Request::History {
            flag,
            since: commands::parse_timestamp(since.as_deref())?,
            until: commands::parse_timestamp(until.as_deref())?,
        },
        Command::Status => Request::Status,
    })
}

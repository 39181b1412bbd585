//! Command-line interface definition for the Scrivener admin console
//!
//! This module defines the CLI structure using clap's derive API,
//! providing operational commands over the session store, quota ledger,
//! and activity log.

use clap::{Parser, Subcommand};

/// Scrivener - document-drafting session control console
///
/// Inspect and administer the session store and quota ledger backing a
/// conversational document-drafting service.
#[derive(Parser, Debug, Clone)]
#[command(name = "scrivener")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Show operational counters
    Stats,

    /// List active sessions
    Sessions,

    /// Show a user's quota standing
    Usage {
        /// User id
        #[arg(short, long)]
        user: i64,
    },

    /// Show recent activity log entries
    Activity {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Drop entries older than the configured retention window
        #[arg(long)]
        purge: bool,
    },

    /// Remove sessions idle past the inactivity limit
    Sweep,

    /// Ban a user
    Ban {
        /// User id to ban
        #[arg(short, long)]
        user: i64,
    },

    /// Lift a user's ban
    Unban {
        /// User id to unban
        #[arg(short, long)]
        user: i64,
    },

    /// List banned users
    Banlist,

    /// Manage VIP tier grants
    Vip {
        /// VIP subcommand
        #[command(subcommand)]
        command: VipCommand,
    },

    /// Terminate a user's session regardless of phase
    Cancel {
        /// User id whose session to terminate
        #[arg(short, long)]
        user: i64,
    },

    /// List broadcast-eligible users
    Broadcast,
}

/// VIP tier subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum VipCommand {
    /// Grant VIP tier to a user
    Add {
        /// User id
        #[arg(short, long)]
        user: i64,
    },

    /// Revoke a runtime-granted VIP tier
    Remove {
        /// User id
        #[arg(short, long)]
        user: i64,
    },

    /// List users with runtime-granted VIP tier
    List,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

//! Scrivener - document-drafting session control console
//!
#![doc = "Scrivener - document-drafting session control console"]
#![doc = "Main entry point for the admin CLI over the session core."]

use anyhow::Result;
use colored::Colorize;
use prettytable::{cell, row, Table};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scrivener::admin::AdminPlane;
use scrivener::cli::{Cli, Commands, VipCommand};
use scrivener::config::Config;
use scrivener::quota::QuotaLedger;
use scrivener::session::{LockTable, SessionStore, UserId};
use scrivener::storage::{Persistence, SqlitePersistence};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path)?;

    // Validate configuration
    config.validate()?;

    // Wire up the control plane over the configured database
    let persistence: Arc<dyn Persistence> = match &config.storage.db_path {
        Some(path) => Arc::new(SqlitePersistence::new_with_path(path.clone())?),
        None => Arc::new(SqlitePersistence::new()?),
    };
    let locks = Arc::new(LockTable::new());
    let ledger = Arc::new(QuotaLedger::new(&config.quota, Arc::clone(&persistence)));
    let store = Arc::new(SessionStore::new(Arc::clone(&persistence)));
    let admin = AdminPlane::new(
        locks,
        Arc::clone(&ledger),
        store,
        persistence,
        config.session.timeout_hours,
        config.storage.persist_retry_attempts,
    );

    // Execute command
    match cli.command {
        Commands::Stats => {
            let stats = admin.stats()?;
            let mut table = Table::new();
            table.add_row(row!["Counter", "Value"]);
            table.add_row(row!["Active sessions", stats.active_sessions]);
            table.add_row(row!["Tracked users", stats.tracked_users]);
            table.add_row(row!["Requests this window", stats.requests_this_window]);
            table.add_row(row!["Banned users", stats.banned_users]);
            table.add_row(row!["VIP users", stats.vip_users]);
            println!();
            table.printstd();
            println!();
            Ok(())
        }
        Commands::Sessions => {
            let sessions = admin.sessions()?;
            if sessions.is_empty() {
                println!("{}", "No active sessions.".yellow());
                return Ok(());
            }
            let mut table = Table::new();
            table.add_row(row!["User", "Kind", "Phase", "Version", "Turns", "Last activity"]);
            for session in sessions {
                table.add_row(row![
                    session.owner,
                    session.document_kind,
                    session.phase,
                    session.version,
                    session.history().len(),
                    session.last_activity_at.format("%Y-%m-%d %H:%M:%S")
                ]);
            }
            println!();
            table.printstd();
            println!();
            Ok(())
        }
        Commands::Usage { user } => {
            let status = admin.usage(UserId(user))?;
            let limit = status
                .limit
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unlimited".to_string());
            let remaining = status
                .remaining
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unlimited".to_string());

            println!("Usage for user {}:", user);
            println!("  Window:    {} (resets {})", status.window, status.reset_date);
            println!("  Used:      {} / {}", status.used, limit);
            println!("  Remaining: {}", remaining);
            println!("  Tier:      {}", status.tier.as_str());
            if status.banned {
                println!("  Status:    {}", "BANNED".red().bold());
            }
            Ok(())
        }
        Commands::Activity { limit, purge } => {
            if purge {
                let removed = admin.purge_activity(config.storage.activity_retention_days)?;
                println!(
                    "Purged {} entries older than {} days.",
                    removed, config.storage.activity_retention_days
                );
            }
            let entries = admin.recent_activity(limit)?;
            if entries.is_empty() {
                println!("{}", "No activity recorded.".yellow());
                return Ok(());
            }
            let mut table = Table::new();
            table.add_row(row!["At", "Actor", "Action", "Target", "Details"]);
            for entry in entries {
                table.add_row(row![
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry
                        .actor
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.action.as_str(),
                    entry
                        .target
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.details
                ]);
            }
            println!();
            table.printstd();
            println!();
            Ok(())
        }
        Commands::Sweep => {
            let expired = admin.expire_idle().await?;
            println!("Expired {} idle session(s).", expired);
            Ok(())
        }
        Commands::Ban { user } => {
            if admin.ban(None, UserId(user)).await? {
                println!("{}", format!("User {} banned.", user).green());
            } else {
                println!(
                    "{}",
                    format!("User {} was not banned (already banned, or an admin).", user)
                        .yellow()
                );
            }
            Ok(())
        }
        Commands::Unban { user } => {
            if admin.unban(None, UserId(user)).await? {
                println!("{}", format!("User {} unbanned.", user).green());
            } else {
                println!("{}", format!("User {} was not banned.", user).yellow());
            }
            Ok(())
        }
        Commands::Banlist => {
            let banned = admin.ban_list()?;
            if banned.is_empty() {
                println!("{}", "No banned users.".green());
            } else {
                println!("Banned users:");
                for user in banned {
                    println!("  {}", user);
                }
            }
            Ok(())
        }
        Commands::Vip { command } => {
            match command {
                VipCommand::Add { user } => {
                    if admin.grant_vip(None, UserId(user)).await? {
                        println!("{}", format!("User {} granted VIP.", user).green());
                    } else {
                        println!(
                            "{}",
                            format!("User {} already has unlimited access.", user).yellow()
                        );
                    }
                }
                VipCommand::Remove { user } => {
                    if admin.revoke_vip(None, UserId(user)).await? {
                        println!("{}", format!("VIP revoked for user {}.", user).green());
                    } else {
                        println!(
                            "{}",
                            format!("User {} had no runtime VIP grant.", user).yellow()
                        );
                    }
                }
                VipCommand::List => {
                    let vips = admin.vip_list()?;
                    if vips.is_empty() {
                        println!("No runtime VIP grants.");
                    } else {
                        println!("VIP users:");
                        for user in vips {
                            println!("  {}", user);
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Cancel { user } => {
            if admin.force_cancel(None, UserId(user)).await? {
                println!("{}", format!("Session for user {} terminated.", user).green());
            } else {
                println!("{}", format!("User {} has no active session.", user).yellow());
            }
            Ok(())
        }
        Commands::Broadcast => {
            let targets = admin.broadcast_targets(None)?;
            println!("{} broadcast-eligible user(s):", targets.len());
            for user in targets {
                println!("  {}", user);
            }
            Ok(())
        }
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scrivener=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

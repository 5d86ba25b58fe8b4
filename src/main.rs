//! MindHaven CLI
//!
//! Run `mindhaven --help` for usage information.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mindhaven::auth::{CredentialStore, SqliteCredentialStore};
use mindhaven::config::Config;
use mindhaven::gateway;

#[derive(Parser)]
#[command(
    name = "mindhaven",
    about = "Authentication and access-control gateway for a student mental-health community",
    version
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Address to bind to (overrides gateway.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides gateway.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage role memberships
    Roles {
        #[command(subcommand)]
        command: RoleCommands,
    },

    /// Inspect accounts
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
enum RoleCommands {
    /// Grant a role to the account with this email
    Grant { email: String, role: String },

    /// Revoke a role from the account with this email
    Revoke { email: String, role: String },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List accounts and their roles
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging.filter, cli.verbose);

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await
        }
        Commands::Roles { command } => {
            let store = open_store(&config)?;
            match command {
                RoleCommands::Grant { email, role } => {
                    let id = account_id_for(&store, &email)?;
                    if store.assign_role(id, &role)? {
                        println!("Granted '{role}' to {email}");
                    } else {
                        println!("{email} already has '{role}'");
                    }
                }
                RoleCommands::Revoke { email, role } => {
                    let id = account_id_for(&store, &email)?;
                    if store.revoke_role(id, &role)? {
                        println!("Revoked '{role}' from {email}");
                    } else {
                        println!("{email} did not have '{role}'");
                    }
                }
            }
            Ok(())
        }
        Commands::Users {
            command: UserCommands::List { format },
        } => {
            let store = open_store(&config)?;
            list_users(&store, &format)
        }
    }
}

/// `RUST_LOG` wins over `logging.filter`; `-v` raises our own crate's level.
fn init_logging(default_filter: &str, verbose: u8) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let directive = match verbose {
        0 => None,
        1 => Some("mindhaven=debug"),
        _ => Some("mindhaven=trace"),
    };
    if let Some(directive) = directive.and_then(|d| d.parse().ok()) {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn open_store(config: &Config) -> Result<SqliteCredentialStore> {
    let path = &config.storage.database_path;
    let store = SqliteCredentialStore::open(path)
        .with_context(|| format!("Failed to open credential store {}", path.display()))?;
    gateway::seed_roles(&store, &config.auth.seed_roles, &config.auth.default_role)?;
    Ok(store)
}

fn account_id_for(store: &SqliteCredentialStore, email: &str) -> Result<i64> {
    match store.find_by_email(&email.trim().to_lowercase())? {
        Some(account) => Ok(account.id),
        None => bail!("No account with email {email}"),
    }
}

fn list_users(store: &SqliteCredentialStore, format: &str) -> Result<()> {
    let accounts = store.list_accounts()?;
    match format {
        "json" => {
            let rows: Vec<_> = accounts
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "user_id": a.account.id,
                        "public_id": a.account.public_id,
                        "username": a.account.username,
                        "email": a.account.email,
                        "nickname": a.account.nickname,
                        "roles": a.roles,
                        "created_at": a.account.created_at,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        "table" => {
            if accounts.is_empty() {
                println!("No accounts.");
                return Ok(());
            }
            println!("{:<6} {:<10} {:<20} {:<32} ROLES", "ID", "PUBLIC", "USERNAME", "EMAIL");
            for a in &accounts {
                println!(
                    "{:<6} {:<10} {:<20} {:<32} {}",
                    a.account.id,
                    a.account.public_id,
                    a.account.username,
                    a.account.email,
                    a.roles.join(",")
                );
            }
        }
        other => bail!("Unknown format '{other}' (expected table or json)"),
    }
    Ok(())
}

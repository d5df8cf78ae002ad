//! `enrollgate`: operator tooling for the enrollment gate.
//!
//! - `enrollgate state` summarizes the durable ban/attempt/rate-limit state
//! - `enrollgate config` validates the environment and prints it redacted
//! - `enrollgate check` resolves one identity against the directory

mod report;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use enrollgate_core::config::DEFAULT_STATE_FILE;
use enrollgate_core::{Config, Identity};

#[derive(Parser)]
#[command(name = "enrollgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the state file.
    ///
    /// Defaults to $BOT_STATE_FILE, then data/bot-state.json.
    State {
        #[arg(long)]
        file: Option<PathBuf>,
        /// Print the raw JSON document instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Validate the environment configuration and print it with secrets redacted.
    Config,

    /// Resolve an identity against the configured directory.
    Check {
        identity: String,
        /// Skip the group check; any enabled account counts as a member.
        #[arg(long)]
        any_group: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for reports.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::State { file, json } => {
            let path = file
                .or_else(|| std::env::var_os("BOT_STATE_FILE").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));
            tracing::debug!(path = %path.display(), "reading state file");
            let state = enrollgate_core::state::load(&path);
            if json {
                println!("{}", state.to_json()?);
            } else {
                let now = chrono::Utc::now().timestamp();
                print!("{}", report::state_summary(&path, &state, now));
            }
        }
        Commands::Config => {
            let config = Config::from_env().context("invalid configuration")?;
            print!("{}", report::config_summary(&config));
        }
        Commands::Check {
            identity,
            any_group,
        } => {
            let identity = Identity::parse(&identity)
                .with_context(|| format!("{identity:?} is not a valid directory identity"))?;
            let config = Config::from_env().context("invalid configuration")?;
            let resolver = enrollgate_ldap::resolver(&config.ldap, !any_group);
            let membership = resolver
                .resolve(&identity)
                .await
                .context("directory lookup failed")?;
            println!("identity:   {identity}");
            println!(
                "group:      {}",
                resolver.group_dn().unwrap_or("(any enabled account)")
            );
            println!("membership: {membership:?}");
            println!(
                "authorized: {}",
                if membership.is_authorized() { "yes" } else { "no" }
            );
        }
    }

    Ok(())
}

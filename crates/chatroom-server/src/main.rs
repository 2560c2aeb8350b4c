use std::io::{self, BufRead, Write};

use clap::{Parser, Subcommand};
use tracing::info;

use chatroom_server::app;
use chatroom_server::config::{Profile, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "chatroom", version, about = "Chatroom server")]
struct Args {
    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Run the HTTP and gateway server (default).
    Serve,
    /// Create the database schema.
    Initdb {
        /// Drop every table first.
        #[arg(long)]
        drop: bool,
        /// Do not ask before dropping.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = ServerConfig::from_env()?;

    // Init logging
    let default_filter = match config.profile {
        Profile::Production => "info",
        _ => "chatroom=debug,tower_http=debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match args.cmd.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Initdb { drop, yes } => initdb(&config, drop, yes),
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let state = app::build_state(&config)?;
    let router = app::router(state);

    info!(
        "Chatroom server ({} profile) listening on {}",
        config.profile, config.listen_addr
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn initdb(config: &ServerConfig, drop: bool, yes: bool) -> anyhow::Result<()> {
    if drop && !yes && !confirm("This operation will delete the database, do you want to continue?")? {
        info!("Aborted");
        return Ok(());
    }

    // Opening runs the migrations
    let db = app::open_database(&config.database)?;
    if drop {
        db.reset()?;
        info!("Dropped all tables");
    }
    info!("Initialized the database");
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

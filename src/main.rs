use std::sync::Arc;

use clap::{Parser, Subcommand};

use coldproxy::config::CoreConfig;
use coldproxy::server::{self, AppState};
use coldproxy::store::Database;

#[derive(Parser)]
#[command(name = "coldproxy")]
#[command(about = "LLM-traffic proxy with end-to-end encrypted interaction capture")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Serve {
        #[arg(long, env = "COLDPROXY_ADDR", default_value = "127.0.0.1:8787")]
        addr: String,

        #[arg(long, env = "COLDPROXY_DB", default_value = "sqlite://coldproxy.db")]
        database_url: String,

        /// WebAuthn relying-party id (domain)
        #[arg(long, env = "COLDPROXY_RP_ID", default_value = "localhost")]
        rp_id: String,

        /// WebAuthn relying-party origin (URL)
        #[arg(long, env = "COLDPROXY_RP_ORIGIN", default_value = "http://localhost:8787")]
        rp_origin: String,

        /// Start with all unlock/decrypt routes disabled
        #[arg(long, env = "COLDPROXY_KILL_SWITCH")]
        kill_switch: bool,
    },
    /// Apply database migrations and exit
    Migrate {
        #[arg(long, env = "COLDPROXY_DB", default_value = "sqlite://coldproxy.db")]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> coldproxy::error::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            addr,
            database_url,
            rp_id,
            rp_origin,
            kill_switch,
        } => {
            let db = Database::connect(&database_url).await?;
            db.migrate().await?;

            let config = CoreConfig {
                rp_id,
                rp_origin,
                kill_switch,
                ..CoreConfig::default()
            };

            let state = Arc::new(AppState::new(db, &config)?);
            server::serve(state, &addr).await?;
        }
        Commands::Migrate { database_url } => {
            let db = Database::connect(&database_url).await?;
            db.migrate().await?;
            tracing::info!("migrations applied");
        }
    }

    Ok(())
}

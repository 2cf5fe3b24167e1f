use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pantrychat::{app, client, config::Config, db, AppState, EntityId, UserId};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pantrychat")]
#[command(about = "Two-party chat relay for the inventory desk", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay and the conversation API
    Serve,

    /// Chat with another user from the terminal
    Chat {
        /// Your user id
        #[arg(long)]
        user: UserId,

        /// User id of the person to talk to
        #[arg(long)]
        peer: UserId,

        /// Site the messages are sent from
        #[arg(long, default_value_t = 0)]
        entity: EntityId,

        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Bearer token, defaults to API_TOKEN
        #[arg(long)]
        token: Option<String>,

        /// Seconds before an unconfirmed message is shown as failed
        #[arg(long)]
        pending_timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Command::Serve => serve().await,
        Command::Chat { user, peer, entity, server, token, pending_timeout } => {
            dotenv::dotenv().ok();
            let token = token.or_else(|| dotenv::var("API_TOKEN").ok());

            client::run_chat(client::ChatOptions {
                server,
                token,
                user_id: user,
                peer_id: peer,
                entity_id: entity,
                pending_timeout: pending_timeout.map(|secs| time::Duration::seconds(secs as i64)),
            })
            .await
        }
    }
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("cannot open {}", config.database_url))?;
    db::init_schema(&db_pool).await.context("cannot create schema")?;

    if config.api_token.is_none() {
        tracing::warn!("API_TOKEN is not set, the API is open to anyone");
    }
    let app_state = AppState::new(db_pool, config.api_token.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", config.bind_addr);
    axum::serve(listener, app(app_state)).await?;
    Ok(())
}

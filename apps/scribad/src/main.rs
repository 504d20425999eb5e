mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use config::AppConfig;
use scriba_channel_telegram::{TelegramBot, TelegramBotConfig, UpdateHandler};
use scriba_core::{
    ChatAction, InboundEvent, OutputSink, ScriptService, ScriptStore, ServiceConfig,
};
use scriba_sandbox::{ProcessExecutor, ProcessExecutorConfig};
use scriba_storage::SqliteStore;
use tracing::info;

#[derive(Parser)]
#[command(name = "scribad")]
#[command(about = "scriba: group script bot daemon")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Telegram long-poll daemon.
    Daemon,
    /// Print the stored script catalog and exit.
    Status,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(&cli.config)?;
    let store = SqliteStore::connect(&cfg.database_path).await?;

    match cli.command {
        Commands::Status => run_status(&store).await,
        Commands::Daemon => run_daemon(&cfg, store).await,
    }
}

async fn run_status(store: &SqliteStore) -> Result<()> {
    let scripts = store.list_all().await?;
    if scripts.is_empty() {
        println!("No scripts stored.");
        return Ok(());
    }
    println!("{} script(s):", scripts.len());
    for script in scripts {
        println!(
            "- {} (author {}, created {}): {}",
            script.name,
            script.author_id,
            script.created_at.to_rfc3339(),
            script.description
        );
    }
    Ok(())
}

async fn run_daemon(cfg: &AppConfig, store: SqliteStore) -> Result<()> {
    let token = std::env::var(&cfg.telegram.bot_token_env).with_context(|| {
        format!(
            "telegram bot token env var {} is not set",
            cfg.telegram.bot_token_env
        )
    })?;

    let bot = TelegramBot::new(TelegramBotConfig {
        token,
        polling_timeout_seconds: cfg.polling_timeout_seconds(),
    })?;

    let executor = Arc::new(ProcessExecutor::new(ProcessExecutorConfig {
        interpreter: cfg.sandbox.interpreter.clone(),
        timeout_secs: cfg.sandbox_timeout_seconds(),
        builtin_whitelist: cfg.sandbox.builtins.clone(),
    })?);

    let service = Arc::new(ScriptService::new(
        Arc::new(store),
        executor,
        bot.member_directory(),
        ServiceConfig {
            authorized_chat_id: cfg.telegram.authorized_chat_id,
            session_ttl: Duration::from_secs(cfg.session_ttl_minutes() * 60),
        },
    ));

    info!(
        authorized_chat_id = cfg.telegram.authorized_chat_id,
        "scribad started"
    );
    bot.run_until_shutdown(Arc::new(ServiceHandler { service })).await
}

struct ServiceHandler {
    service: Arc<ScriptService>,
}

#[async_trait]
impl UpdateHandler for ServiceHandler {
    async fn handle_event(
        &self,
        event: InboundEvent,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Vec<ChatAction>> {
        self.service.handle_event(event, sink).await
    }
}

// ABOUTME: Main entry point for the VK bot
// ABOUTME: Initializes logging and config, logs every account in, then runs the long-poll dispatch loop

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vkbot::api::{
    ApiClient, ApiTransport, ClientPool, HttpTransport, HttpUploader, MethodCapabilities,
    NoCaptchaSolver, Session,
};
use vkbot::config::Config;
use vkbot::longpoll::{EventDispatchLoop, HttpPollTransport, LongPollSession};
use vkbot::router::{seed_roles, BuiltinCommands, MessageRouter};
use vkbot::store::SqliteStore;
use vkbot::{metrics, paths};

/// Headroom on top of the server-side long-poll wait
const POLL_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "vkbot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and start handling messages (default)
    Run {
        /// Path to config.toml
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Load and validate the configuration, then print it with secrets redacted
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&log_dir, "vkbot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vkbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

async fn build_pool(config: &Config) -> Result<ClientPool> {
    let mut clients = Vec::with_capacity(config.vk.accounts.len());
    for (index, account) in config.vk.accounts.iter().enumerate() {
        let label = account.label(index);
        let credentials = account.credentials(config.vk.app_id, config.vk.scope)?;
        let proxy = config.proxy_for(index).map(|p| p.settings());
        let transport: Arc<dyn ApiTransport> = Arc::new(HttpTransport::new(
            config.vk.api_url.clone(),
            config.vk.api_version.clone(),
            config.api.request_timeout(),
            proxy.as_ref(),
        )?);
        let session = Session::new(
            label.clone(),
            credentials,
            transport,
            account.token_provider(),
            Arc::new(NoCaptchaSolver),
        );
        let client = ApiClient::connect(session, config.rate.client_settings())
            .await
            .with_context(|| format!("Failed to log in account {}", label))?;
        clients.push(client);
    }

    let capabilities =
        MethodCapabilities::default().with_group_methods(config.vk.group_methods.iter().cloned());
    let pool = ClientPool::new(clients)
        .with_capabilities(capabilities)
        .with_call_timeout(config.api.call_timeout())
        .with_uploader(Arc::new(HttpUploader::new(config.api.request_timeout())?))
        .with_group_id(config.vk.group_id);
    tracing::info!(
        users = pool.user_count(),
        groups = pool.group_count(),
        "API client pool ready"
    );
    Ok(pool)
}

async fn run(config: Config) -> Result<()> {
    if let Some(listen) = &config.metrics.listen {
        metrics::init_metrics(listen)?;
    }

    let pool = Arc::new(build_pool(&config).await?);

    let store = Arc::new(SqliteStore::open(config.workspace.store_path())?);
    seed_roles(store.as_ref(), &config.bot).await?;

    let router = Arc::new(MessageRouter::new(
        config.bot.clone(),
        store,
        pool.clone(),
        Arc::new(BuiltinCommands),
    ));

    let poll_timeout = Duration::from_secs(u64::from(config.longpoll.wait)) + POLL_TIMEOUT_MARGIN;
    let session = LongPollSession::new(
        pool.clone(),
        Arc::new(HttpPollTransport::new(poll_timeout)?),
        config.longpoll.clone(),
    );

    tracing::info!("Bot ready");
    EventDispatchLoop::new(session, router)
        .run()
        .await
        .context("Long-poll dispatch stopped")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic hook to log panics before they crash the process
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nPANIC! Bot crashed with the following error:\n");
        eprintln!("{}", panic_info);
        eprintln!("\nBacktrace:");
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    match cli.command.unwrap_or(Commands::Run { config: None }) {
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{:#?}", config);
            println!("Configuration OK");
            Ok(())
        }
        Commands::Run { config } => {
            let _guard = init_logging()?;
            tracing::info!("Starting VK bot");

            let config = load_config(config.as_deref())?;
            tracing::info!(
                accounts = config.vk.accounts.len(),
                proxies = config.vk.proxies.len(),
                api_version = %config.vk.api_version,
                workspace = %config.workspace.path,
                "Configuration loaded"
            );

            if let Err(e) = run(config).await {
                tracing::error!(error = %format!("{:#}", e), "Bot stopped");
                return Err(e);
            }
            Ok(())
        }
    }
}

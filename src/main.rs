use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use tally::api::{self, AppState};
use tally::auth::{self, AuthStorage};
use tally::config::{ImageDelivery, Provider, ServerConfig};
use tally::consts::{DEFAULT_BIND, TOGETHER_API_KEY_ENV, default_db_path};
use tally::dispatch::Dispatcher;
use tally::extractor::Extractor;
use tally::extractor::ollama::OllamaExtractor;
use tally::extractor::together::TogetherExtractor;
use tally::processor::TaskProcessor;
use tally::prompts::receipt::load_prompt;
use tally::store::TaskStore;
use tally::store::sqlite::SqliteTaskStore;

#[derive(Parser)]
#[command(name = "tally", version, about = "Upload a receipt, poll for its contents as JSON.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// SQLite database path for tasks and credentials
    #[arg(short, long, global = true, env = "TALLY_DB")]
    db: Option<PathBuf>,

    /// Server options, used when no subcommand is given
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Store an API key for a hosted provider
    Login {
        /// Provider to store the key for
        #[arg(default_value = "together")]
        provider: String,
    },
    /// Remove a stored API key
    Logout {
        #[arg(default_value = "together")]
        provider: String,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(short, long, env = "TALLY_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Extraction backend
    #[arg(short, long, value_enum, env = "TALLY_PROVIDER", default_value_t = Provider::Together)]
    provider: Provider,

    /// Model name (provider-specific)
    #[arg(long, env = "TALLY_MODEL")]
    model: Option<String>,

    /// How the hosted model receives the image
    #[arg(long, value_enum, env = "TALLY_IMAGE_DELIVERY", default_value_t = ImageDelivery::Inline)]
    image_delivery: ImageDelivery,

    /// Base URL of the Ollama server
    #[arg(long, env = "TALLY_OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Replace the built-in extraction prompt with the contents of a file
    #[arg(long, env = "TALLY_PROMPT_FILE")]
    prompt_file: Option<PathBuf>,

    /// Maximum concurrent extractions
    #[arg(short, long, env = "TALLY_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Extraction timeout in seconds
    #[arg(short, long, env = "TALLY_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Largest accepted upload in megabytes
    #[arg(long, env = "TALLY_MAX_UPLOAD_MB", default_value_t = 20)]
    max_upload_mb: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "TALLY_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "TALLY_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Some(Command::Login { provider }) => handle_login(&db_path, &provider),
        Some(Command::Logout { provider }) => handle_logout(&db_path, &provider),
        None => {
            init_tracing(&cli.serve.log_level, cli.serve.log_json);
            let config = ServerConfig {
                bind: cli.serve.bind,
                db_path,
                provider: cli.serve.provider,
                model: cli.serve.model,
                image_delivery: cli.serve.image_delivery,
                ollama_url: cli.serve.ollama_url,
                prompt_file: cli.serve.prompt_file,
                workers: cli.serve.workers,
                extraction_timeout: Duration::from_secs(cli.serve.timeout),
                max_upload_mb: cli.serve.max_upload_mb,
            };
            serve(config).await
        }
    }
}

fn init_tracing(log_level: &str, json: bool) {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!("warning: invalid log filter '{}' ({}); using 'info'", log_level, e);
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!(version = env!("CARGO_PKG_VERSION"), "tally starting");

    ensure_parent_dir(&config.db_path)?;
    let db_path = config.db_path_str();

    let store: Arc<dyn TaskStore> =
        Arc::new(SqliteTaskStore::open(&db_path).context("failed to open task database")?);
    info!(db = %db_path, "database ready");

    let extractor = build_extractor(&config, &db_path)?;
    info!(provider = extractor.name(), "extractor ready");

    let processor = Arc::new(TaskProcessor::new(
        Arc::clone(&store),
        extractor,
        config.extraction_timeout,
    ));
    let (dispatcher, worker) = Dispatcher::start(processor, config.workers);

    // Pick up tasks a previous run accepted but never finished.
    let unfinished = store.reclaim_unfinished().await?;
    if !unfinished.is_empty() {
        info!(count = unfinished.len(), "re-dispatching unfinished tasks");
    }
    for task_id in unfinished {
        dispatcher.dispatch(task_id);
    }

    let app = api::router(
        AppState {
            store,
            dispatcher,
        },
        config.max_upload_bytes(),
    );
    let addr: SocketAddr = config.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router (and with it every dispatcher handle) is gone; let the
    // worker finish what it has.
    worker.join().await;
    info!("tally stopped");
    Ok(())
}

fn build_extractor(config: &ServerConfig, db_path: &str) -> anyhow::Result<Arc<dyn Extractor>> {
    let prompt = load_prompt(config.prompt_file.as_deref())?;

    match config.provider {
        Provider::Together => {
            let auth = AuthStorage::open(db_path)?;
            let api_key = auth
                .get_api_key("together", TOGETHER_API_KEY_ENV)?
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "no Together API key found. Run `tally login` or set {}.",
                        TOGETHER_API_KEY_ENV
                    )
                })?;
            let extractor = TogetherExtractor::new(
                api_key,
                config.model.clone(),
                prompt,
                config.image_delivery,
            );
            info!(model = extractor.model(), delivery = ?config.image_delivery, "using Together");
            Ok(Arc::new(extractor))
        }
        Provider::Ollama => {
            let extractor =
                OllamaExtractor::new(config.ollama_url.clone(), config.model.clone(), prompt);
            info!(model = extractor.model(), "using Ollama");
            Ok(Arc::new(extractor))
        }
    }
}

fn handle_login(db_path: &std::path::Path, provider: &str) -> anyhow::Result<()> {
    ensure_parent_dir(db_path)?;
    print!("Paste the {provider} API key: ");
    io::stdout().flush()?;
    let mut key = String::new();
    io::stdin().read_line(&mut key)?;

    auth::login(&db_path.to_string_lossy(), provider, &key)?;
    println!("✓ Stored {provider} API key in {}", db_path.display());
    Ok(())
}

fn handle_logout(db_path: &std::path::Path, provider: &str) -> anyhow::Result<()> {
    auth::logout(&db_path.to_string_lossy(), provider)?;
    println!("✓ Removed {provider} API key.");
    Ok(())
}

fn ensure_parent_dir(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

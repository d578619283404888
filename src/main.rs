//! # relay
//!
//! Relay server binary: loads settings, wires the chat client, token
//! authority and message store into the server, and serves until a
//! shutdown signal arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_auth::{Identity, JwtAuthority, PasswordHasher};
use relay_core::ApiKey;
use relay_llm::{ChatClientConfig, OpenAiCompatClient};
use relay_server::{RelayServer, ServerConfig};
use relay_settings::{LoadedSettings, LoggingSettings, RelaySettings, StoreBackend, StoreSettings};
use relay_store::{MemoryStore, MessageStore, SqliteStore, UserStore};
use relay_telemetry::{parse_level, LogFormat, TelemetryConfig};
use secrecy::SecretString;
use tracing::{info, warn};

/// Phone/PC message relay with streamed AI replies.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Phone/PC message relay with streamed AI replies")]
struct Cli {
    /// Settings file (JSON). Missing file means defaults.
    #[arg(long, env = "RELAY_CONFIG", default_value = "relay.json")]
    config: PathBuf,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Upstream API key.
    #[arg(long)]
    ai_api_key: Option<String>,

    /// Upstream base URL, e.g. `https://api.openai.com/v1`.
    #[arg(long)]
    ai_base_url: Option<String>,

    /// Upstream model name.
    #[arg(long)]
    ai_model: Option<String>,

    /// Default log level (`RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Print a signed token for a user, for local testing.
    Token {
        #[arg(long)]
        user_id: String,
        #[arg(long, default_value = "dev")]
        username: String,
    },
}

impl Cli {
    /// CLI flags take precedence over file and environment.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(key) = &self.ai_api_key {
            settings.ai.api_key.clone_from(key);
        }
        if let Some(url) = &self.ai_base_url {
            settings.ai.base_url.clone_from(url);
        }
        if let Some(model) = &self.ai_model {
            settings.ai.model.clone_from(model);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn telemetry_config(logging: &LoggingSettings) -> Result<TelemetryConfig> {
    let module_levels = logging
        .module_levels
        .iter()
        .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(TelemetryConfig {
        log_level: parse_level(&logging.level)?,
        module_levels,
        format: logging.format.parse::<LogFormat>()?,
    })
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Messages and accounts share one backend.
fn build_store(store: &StoreSettings) -> Result<(Arc<dyn MessageStore>, Arc<dyn UserStore>)> {
    match store.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::new());
            let messages: Arc<dyn MessageStore> = memory.clone();
            let users: Arc<dyn UserStore> = memory;
            Ok((messages, users))
        }
        StoreBackend::Sqlite => {
            let path = PathBuf::from(&store.path);
            ensure_parent_dir(&path)?;
            let sqlite = Arc::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("failed to open store: {}", path.display()))?,
            );
            let messages: Arc<dyn MessageStore> = sqlite.clone();
            let users: Arc<dyn UserStore> = sqlite;
            Ok((messages, users))
        }
    }
}

fn authority(settings: &RelaySettings) -> Arc<JwtAuthority> {
    Arc::new(JwtAuthority::new(
        &SecretString::from(settings.auth.jwt_secret.clone()),
        settings.auth.token_ttl_hours,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let LoadedSettings { mut settings, rejected } =
        relay_settings::load_settings_from_path(&cli.config).context("failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("invalid settings")?;

    relay_telemetry::init_telemetry(&telemetry_config(&settings.logging)?)
        .context("failed to initialize logging")?;
    for r in &rejected {
        warn!(key = r.key, value = %r.value, expected = r.expected, "ignoring invalid environment override");
    }

    match &cli.command {
        Some(Command::Token { user_id, username }) => {
            let token = authority(&settings)
                .issue(&Identity::new(user_id.as_str(), username.as_str()))
                .context("failed to issue token")?;
            println!("{token}");
            Ok(())
        }
        Some(Command::Serve) | None => serve(settings).await,
    }
}

async fn serve(settings: RelaySettings) -> Result<()> {
    let metrics = match relay_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let (store, users) = build_store(&settings.store)?;
    if settings.ai.api_key.trim().is_empty() {
        warn!("no AI API key configured; upstream requests will be refused");
    }
    let chat = OpenAiCompatClient::new(ChatClientConfig {
        base_url: settings.ai.base_url.clone(),
        api_key: ApiKey::new(settings.ai.api_key.clone()),
        model: settings.ai.model.clone(),
        thinking: settings.ai.thinking.clone(),
    })
    .context("failed to build chat client")?;
    info!(endpoint = chat.endpoint(), "chat client ready");

    let authority = authority(&settings);
    let mut server = RelayServer::new(
        ServerConfig::from_settings(&settings),
        Arc::new(chat),
        authority.clone(),
        store,
    )
    .with_issuer(authority)
    .with_users(users, PasswordHasher::new(settings.auth.bcrypt_cost));
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("failed to bind server")?;
    info!("relay listening on http://{addr}");

    shutdown_signal().await;
    info!("shutting down");
    if server.shutdown().drain(vec![handle], server.config().shutdown_timeout()).await {
        info!("shutdown complete");
    }
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

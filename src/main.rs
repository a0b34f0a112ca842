mod config;
mod logging;
mod proxy;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use reqwest::Client;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{EdgeConfig, config_file_path, load_config, write_template};
use crate::proxy::{
    API_AFFINITY_COOKIE, AUTH_AFFINITY_COOKIE, ProxyService, RouteConfig, router as proxy_router,
};

#[derive(Parser, Debug)]
#[command(name = "opengater-edge")]
#[command(about = "Failover edge proxy for the opengater dashboard", long_about = None)]
struct Cli {
    /// Path to config.toml (default: ~/.opengater-edge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Write tracing output to daily files under this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the edge proxy server (default command)
    Serve {
        /// Listen port; overrides [server].port from the config
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage the edge config file
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
    /// Show the resolved profile and upstream lists
    Status {
        /// Output as JSON (machine-readable), without ANSI colors
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write a commented config template
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path that will be used
    Path,
    /// Print the parsed config back as TOML
    Show,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Errors related to the edge config file
    Config(String),
    /// Generic fallback for other failures
    Other(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Config error: {}", msg),
            CliError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e.to_string())
    }
}

impl From<config::ConfigError> for CliError {
    fn from(e: config::ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("{}", err.to_string().red());
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli);

    let config_path = cli.config.clone().unwrap_or_else(config_file_path);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            let cfg = load_config(&config_path).await.map_err(|e| {
                CliError::Config(format!(
                    "{e}; run `opengater-edge config init` to create one"
                ))
            })?;
            run_server(cfg, port)
                .await
                .map_err(|e| CliError::Other(e.to_string()))?;
        }
        Command::Config { cmd } => handle_config_cmd(cmd, &config_path).await?,
        Command::Status { json } => handle_status_cmd(&config_path, json).await?,
    }

    Ok(())
}

fn init_tracing(cli: &Cli) -> Option<WorkerGuard> {
    // Default to info logs unless the user sets RUST_LOG.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(dir) = cli.log_dir.as_ref() {
        let _ = std::fs::create_dir_all(dir);
        let file_appender = tracing_appender::rolling::daily(dir, "opengater-edge.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        None
    }
}

async fn handle_config_cmd(cmd: ConfigCommand, config_path: &Path) -> CliResult<()> {
    match cmd {
        ConfigCommand::Init { force } => {
            let written = write_template(config_path, force).await?;
            println!("Wrote config template to {}", written.display());
        }
        ConfigCommand::Path => {
            println!("{}", config_path.display());
        }
        ConfigCommand::Show => {
            let cfg = load_config(config_path).await?;
            let text = toml::to_string_pretty(&cfg).map_err(|e| CliError::Other(e.to_string()))?;
            print!("{text}");
        }
    }
    Ok(())
}

async fn handle_status_cmd(config_path: &Path, json: bool) -> CliResult<()> {
    let cfg = load_config(config_path).await?;
    let (profile_name, profile) = cfg.active_profile_entry()?;

    if json {
        let value = serde_json::json!({
            "config_path": config_path.display().to_string(),
            "active_profile": profile_name,
            "listen": format!("{}:{}", cfg.server.host, cfg.server.port),
            "api_upstreams": profile.api_upstreams,
            "auth_upstreams": profile.auth_upstreams,
            "api_cookie": API_AFFINITY_COOKIE,
            "auth_cookie": AUTH_AFFINITY_COOKIE,
        });
        let text =
            serde_json::to_string_pretty(&value).map_err(|e| CliError::Other(e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    println!("{}", format!("profile: {profile_name}").bold());
    println!("listen:  {}:{}", cfg.server.host, cfg.server.port);
    print_upstreams("api upstreams", &profile.api_upstreams, API_AFFINITY_COOKIE);
    print_upstreams("auth upstreams", &profile.auth_upstreams, AUTH_AFFINITY_COOKIE);
    Ok(())
}

fn print_upstreams(label: &str, upstreams: &[String], cookie: &str) {
    println!("{} (affinity cookie: {}):", label.bold(), cookie);
    if upstreams.is_empty() {
        println!("  {}", "(none configured)".yellow());
        return;
    }
    for (idx, upstream) in upstreams.iter().enumerate() {
        println!("  {}. {}", idx + 1, upstream.green());
    }
}

async fn run_server(cfg: EdgeConfig, port_override: Option<u16>) -> anyhow::Result<()> {
    let (profile_name, profile) = cfg.active_profile_entry()?;
    if profile.api_upstreams.is_empty() && profile.auth_upstreams.is_empty() {
        anyhow::bail!("profile '{profile_name}' configures no upstreams for either route");
    }
    if profile.api_upstreams.is_empty() {
        tracing::warn!(
            profile = profile_name,
            "no api upstreams configured; /api/proxy will answer 502 without attempts"
        );
    }
    if profile.auth_upstreams.is_empty() {
        tracing::warn!(
            profile = profile_name,
            "no auth upstreams configured; /api/auth will answer 502 without attempts"
        );
    }

    // Redirects are relayed to the caller, never followed here.
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let attempt_timeout = cfg.server.attempt_timeout();

    let api = ProxyService::new(
        client.clone(),
        RouteConfig::api(profile.api_upstreams.clone()),
        attempt_timeout,
        cfg.server.max_body_bytes,
    );
    let auth = ProxyService::new(
        client,
        RouteConfig::auth(profile.auth_upstreams.clone()),
        attempt_timeout,
        cfg.server.max_body_bytes,
    );
    let app = proxy_router(api, auth);

    let host: IpAddr = cfg
        .server
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid [server].host '{}': {e}", cfg.server.host))?;
    let port = port_override.unwrap_or(cfg.server.port);
    let addr = SocketAddr::new(host, port);
    let listener = bind_listener_or_explain(addr).await?;
    tracing::info!(
        profile = profile_name,
        "opengater-edge listening on http://{}",
        addr
    );

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }
    let server_shutdown = async move {
        let _ = shutdown_rx.changed().await;
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(server_shutdown)
        .await?;
    Ok(())
}

async fn bind_listener_or_explain(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        let help = if err.kind() == std::io::ErrorKind::AddrInUse {
            format!(
                "Port {} is already in use. Is another opengater-edge instance running? \
Use `--port` or edit [server].port in the config.",
                addr.port()
            )
        } else {
            format!("Failed to bind {addr}")
        };
        anyhow::Error::new(err).context(help)
    })
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

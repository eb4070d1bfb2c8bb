//! Command-line interface: argument parsing and command execution.

use crate::config::Config;
use crate::dns::DnsServer;
use crate::server;
use crate::state::AppState;
use crate::store::ModelStore;
use crate::upstream::UpstreamClient;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line interface for the cache server.
#[derive(Parser)]
#[command(name = "ollama-lancache")]
#[command(about = "LAN-local caching proxy for the Ollama model registry")]
#[command(version)]
pub struct Cli {
    /// Optional JSON config file; flags override its values
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the DNS interceptor and the Registry v2 caching proxy
    Server {
        /// Root directory for the cache
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Bind address for both listeners
        #[arg(long)]
        listen_addr: Option<String>,
        /// TCP port for the proxy (443 enables the self-signed TLS shim)
        #[arg(long)]
        http_port: Option<u16>,
        /// UDP port for the DNS server
        #[arg(long)]
        dns_port: Option<u16>,
        /// Disable the HTTP proxy listener
        #[arg(long)]
        no_http: bool,
        /// Disable the DNS listener
        #[arg(long)]
        no_dns: bool,
        /// Upstream resolver for forwarded DNS queries (host:port)
        #[arg(long)]
        upstream_dns: Option<String>,
        /// Hostname to intercept and cache for
        #[arg(long)]
        registry_host: Option<String>,
        /// Override the upstream registry base URL
        #[arg(long)]
        upstream_url: Option<String>,
    },
    /// Cache management commands
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache statistics and the cached model list
    Stats,
    /// Remove all cached blobs and manifests
    Clear {
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

/// Parse arguments, initialize logging, and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Server {
            cache_dir,
            listen_addr,
            http_port,
            dns_port,
            no_http,
            no_dns,
            upstream_dns,
            registry_host,
            upstream_url,
        } => {
            if let Some(cache_dir) = cache_dir {
                config.cache_dir = cache_dir;
            }
            if let Some(listen_addr) = listen_addr {
                config.listen_addr = listen_addr;
            }
            if let Some(http_port) = http_port {
                config.http_port = http_port;
            }
            if let Some(dns_port) = dns_port {
                config.dns_port = dns_port;
            }
            if no_http {
                config.http_enabled = false;
            }
            if no_dns {
                config.dns_enabled = false;
            }
            if let Some(upstream_dns) = upstream_dns {
                config.upstream_dns = upstream_dns;
            }
            if let Some(registry_host) = registry_host {
                config.registry_host = registry_host;
            }
            if let Some(upstream_url) = upstream_url {
                config.upstream_url = upstream_url;
            }
            run_server(config).await
        }
        Commands::Cache { command } => match command {
            CacheCommands::Stats => run_cache_stats(&config),
            CacheCommands::Clear { yes } => run_cache_clear(&config, yes),
        },
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "ollama_lancache=debug,tower_http=debug"
    } else {
        "ollama_lancache=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let store = Arc::new(
        ModelStore::new(&config.cache_dir).with_context(|| {
            format!("failed to initialize cache at {}", config.cache_dir.display())
        })?,
    );

    print_startup_banner(&config, &store);

    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_url(),
        config.control_timeout(),
    )?);
    let state = Arc::new(AppState::new(store, config.clone(), upstream));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(2);
    let mut tasks = JoinSet::new();

    if config.http_enabled {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        let fatal = fatal_tx.clone();
        tasks.spawn(async move {
            if let Err(e) = server::run_http(state, shutdown).await {
                let _ = fatal.send(e.context("HTTP proxy failed")).await;
            }
        });
    }

    if config.dns_enabled {
        let dns = DnsServer::bind(
            &config.listen_addr,
            config.dns_port,
            config.upstream_dns.clone(),
            &config.registry_host,
            redirect_ip(&config),
        )
        .await?;
        let shutdown = shutdown_rx.clone();
        let fatal = fatal_tx.clone();
        tasks.spawn(async move {
            if let Err(e) = dns.run(shutdown).await {
                let _ = fatal.send(e.context("DNS server failed")).await;
            }
        });
    }
    drop(fatal_tx);

    if tasks.is_empty() {
        anyhow::bail!("both listeners are disabled, nothing to run");
    }

    let failure = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received termination signal, shutting down");
            None
        }
        failure = fatal_rx.recv() => failure,
    };
    let _ = shutdown_tx.send(true);

    // Listeners get the graceful window plus a little slack, then the
    // JoinSet aborts whatever is left when it drops.
    let deadline = server::SHUTDOWN_GRACE + Duration::from_secs(2);
    let _ = tokio::time::timeout(deadline, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    match failure {
        Some(e) => {
            error!(error = %e, "Server exiting after fatal error");
            Err(e)
        }
        None => {
            info!("Server shutdown complete");
            Ok(())
        }
    }
}

/// The IPv4 handed out in intercepted DNS answers: the bind address when
/// it is a concrete one, otherwise the host's primary LAN address.
fn redirect_ip(config: &Config) -> Ipv4Addr {
    if let Ok(ip) = config.listen_addr.parse::<Ipv4Addr>() {
        if !ip.is_unspecified() {
            return ip;
        }
    }
    server::local_ipv4s()
        .into_iter()
        .next()
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn print_startup_banner(config: &Config, store: &ModelStore) {
    info!("=== Ollama LanCache Server Starting ===");
    info!(cache_dir = %config.cache_dir.display(), "Cache directory");

    if let Ok(stats) = store.stats() {
        info!(
            manifests = stats.manifest_count,
            blobs = stats.blob_count,
            total_mb = stats.total_blob_mb,
            "Cache status"
        );
    }
    match store.manifest_keys() {
        Ok(keys) if !keys.is_empty() => {
            info!("Cached models:");
            for key in keys {
                info!("  - {}", key.model_ref());
            }
        }
        _ => info!("Cached models: none (cache is empty)"),
    }

    let ips = server::local_ipv4s();
    if let Some(primary) = ips.first() {
        let all = ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        info!(addresses = %all, "Server IP address(es)");
        info!(
            "Clients without DNS interception can add: {} {} to /etc/hosts",
            primary, config.registry_host
        );
        info!(
            "Test with: curl http://{}:{}/health",
            primary, config.http_port
        );
    }
}

fn open_store(config: &Config) -> anyhow::Result<ModelStore> {
    ModelStore::new(&config.cache_dir).with_context(|| {
        format!("failed to initialize cache at {}", config.cache_dir.display())
    })
}

fn run_cache_stats(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let stats = store.stats()?;

    println!("Cache Statistics:");
    println!("  Directory: {}", stats.cache_directory.display());
    println!("  Blobs: {}", stats.blob_count);
    println!("  Manifests: {}", stats.manifest_count);
    println!(
        "  Total Size: {} MB ({} bytes)",
        stats.total_blob_mb, stats.total_blob_bytes
    );
    match stats.last_updated {
        Some(when) => println!("  Last Updated: {}", when.to_rfc3339()),
        None => println!("  Last Updated: never"),
    }

    let keys = store.manifest_keys()?;
    if keys.is_empty() {
        println!("  Models: none");
    } else {
        println!("  Models:");
        for key in keys {
            println!("    - {}", key.model_ref());
        }
    }
    Ok(())
}

fn run_cache_clear(config: &Config, yes: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;

    if !yes {
        print!(
            "Are you sure you want to clear the cache at {}? (y/N): ",
            config.cache_dir.display()
        );
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            println!("Cache clear cancelled.");
            return Ok(());
        }
    }

    store.clear()?;
    println!("Cache cleared successfully.");
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use zepsec_agent::config::Config;
use zepsec_agent::netdetect::{self, ExternalIpResolver};
use zepsec_agent::pipeline::Pipeline;
use zepsec_agent::registry::JobRegistry;
use zepsec_agent::report::ReportDelivery;
use zepsec_agent::scanner::ScanExecutor;
use zepsec_agent::scheduler::Scheduler;
use zepsec_agent::server::{self, AppState};
use zepsec_agent::{logging, tls};

/// How long in-flight inbound jobs may keep running after shutdown starts.
const JOB_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// zepsec-agent: runs nmap on request or on a schedule and reports results
/// to the management service.
#[derive(Debug, Clone, Parser)]
#[command(name = "zepsec-agent", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML config file. A missing file means defaults plus env.
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Load and validate the configuration, print a summary and exit.
    #[arg(long = "check-config", default_value_t = false)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("configuration error")?;

    if cli.check_config {
        print_summary(&cli, &config);
        return Ok(());
    }

    logging::init_tracing(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "zepsec agent starting");
    info!(
        listen = %config.agent.listen_addr,
        server = %config.server.url,
        nmap = %config.nmap.binary_path,
        sudo = config.nmap.use_sudo,
        "configuration loaded"
    );
    match netdetect::local_interfaces() {
        Ok(addrs) if !addrs.is_empty() => info!(?addrs, "local interfaces"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to enumerate interfaces"),
    }

    let executor = ScanExecutor::new(&config.nmap);
    let resolver = ExternalIpResolver::new(&config.network)?;
    let delivery = ReportDelivery::new(&config.server, &config.delivery)?;
    info!(endpoint = delivery.endpoint(), "results endpoint");
    let runner = Arc::new(Pipeline::new(executor, resolver, delivery));

    let registry = JobRegistry::new();
    let tasks = TaskTracker::new();

    let state = AppState::new(
        &config.agent.secret,
        registry.clone(),
        runner.clone(),
        tasks.clone(),
    );
    let app = server::router(state);

    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let server_task = match (&config.agent.tls_cert, &config.agent.tls_key) {
        (Some(cert), Some(key)) => {
            let acceptor = tls::load_acceptor(cert, key)?;
            info!(%addr, "listening (TLS)");
            let listener = tls::TlsListener::new(listener, acceptor)?;
            let stop = shutdown.clone().cancelled_owned();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(stop)
                    .await
            })
        }
        _ => {
            info!(%addr, "listening (plain HTTP)");
            let stop = shutdown.clone().cancelled_owned();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(stop)
                    .await
            })
        }
    };

    let scheduler = Scheduler::start(config.scheduled_scans(), runner, registry);

    shutdown.cancelled().await;
    info!("shutting down");

    scheduler.stop().await;

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }

    tasks.close();
    if !tasks.is_empty() {
        info!(jobs = tasks.len(), "waiting for in-flight scan jobs");
    }
    if tokio::time::timeout(JOB_DRAIN_GRACE, tasks.wait()).await.is_err() {
        warn!(jobs = tasks.len(), "abandoning scan jobs still running");
    }

    info!("shutdown complete");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn forward_signals(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!(signal = "SIGINT", "received signal"),
                    _ = term.recv() => info!(signal = "SIGTERM", "received signal"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
    token.cancel();
}

fn print_summary(cli: &Cli, config: &Config) {
    println!("zepsec-agent configuration ({}):", cli.config.display());
    println!("  listen_addr  : {}", config.agent.listen_addr);
    println!("  tls          : {}", config.agent.tls_enabled());
    println!("  server       : {}", config.server.url);
    println!("  verify_tls   : {}", config.server.verify_tls);
    println!(
        "  nmap         : {} (sudo={})",
        config.nmap.binary_path, config.nmap.use_sudo
    );
    println!("  temp_dir     : {}", config.nmap.temp_dir.display());
    println!(
        "  timeout      : {}",
        config
            .nmap
            .timeout
            .map(|t| humantime::format_duration(t).to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  scheduled    : {}", config.scans.len());
    for scan in config.scheduled_scans() {
        println!(
            "    - {:<16} every {:<8} {}",
            scan.name,
            humantime::format_duration(scan.interval).to_string(),
            scan.command_line()
        );
    }
}

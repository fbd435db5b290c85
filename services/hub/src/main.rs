use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use hub::directories::Directories;
use hub::{Hub, HubConfig, ShutdownKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hub", about = "Application messaging hub")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:26423")]
    bind: SocketAddr,
    /// Data directory; defaults to the platform data dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Token that grants the dashboard role.
    #[arg(long)]
    dashboard_token: Option<String>,
    /// Disconnect sessions whose Origin header does not match their app
    /// namespace instead of just logging it.
    #[arg(long)]
    strict_origin: bool,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let mut config = HubConfig::new(
        args.bind,
        args.data_dir.unwrap_or_else(Directories::default_root),
    );
    config.dashboard_token = args.dashboard_token;
    config.strict_origin = args.strict_origin;

    let hub = Hub::new(config).expect("failed to initialize hub");
    hub.start().await.expect("failed to start hub");

    let listener = tokio::net::TcpListener::bind(&hub.config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %hub.config.bind_addr, "hub listening");

    let router = hub::build_router(hub.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await
        .expect("server error");
    info!("hub shut down gracefully");

    if hub.shutdown_requested() == Some(ShutdownKind::Restart) {
        restart();
    }
}

/// Waits for SIGTERM, Ctrl-C, or a shutdown endpoint call.
async fn shutdown_signal(hub: std::sync::Arc<Hub>) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
        kind = hub.wait_for_shutdown() => { info!(?kind, "shutdown endpoint called"); },
    }
}

/// Re-execs the original launch command.
fn restart() -> ! {
    let exe = env::current_exe().expect("failed to resolve current executable");
    let args: Vec<String> = env::args().skip(1).collect();
    info!(exe = %exe.display(), "restarting");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = std::process::Command::new(&exe).args(&args).exec();
        panic!("failed to re-exec: {err}");
    }

    #[cfg(not(unix))]
    {
        let status = std::process::Command::new(&exe)
            .args(&args)
            .spawn()
            .and_then(|mut child| child.wait())
            .expect("failed to respawn");
        std::process::exit(status.code().unwrap_or(0));
    }
}

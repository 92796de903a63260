use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use network_interface::{
    cli::{Cli, Command, RunArgs},
    counters::NoopCounters,
    server::CommandServer,
    tcp_pool::TcpConnectionPool,
    CallbackHandle, NetworkInterface, NetworkInterfaceOptions, PoolOptions, RemoteCommandRequest,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let listener = TcpListener::bind(args.listen).await?;
            let server = CommandServer::new(listener);
            let addr = server.local_addr()?;
            info!("command server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("command server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Run(args) => run(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let cmd = serde_json::from_str(&args.cmd).context("--cmd must be a JSON document")?;
    let mut request = RemoteCommandRequest::new(args.hosts, args.db, cmd).with_failure_tolerance(args.max_failures);
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(timeout_ms));
    }

    let pool = TcpConnectionPool::new(
        PoolOptions::default()
            .with_max_connections_per_host(args.max_connections)
            .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms)),
    );
    let interface = NetworkInterface::new(
        NetworkInterfaceOptions::default().with_instance_name(args.instance_name),
        Arc::new(pool),
        Arc::new(NoopCounters),
    );
    interface.startup().context("failed to start network interface")?;

    let outcome = match interface.run_command(CallbackHandle::new(1), request) {
        Ok(pending) => pending.await,
        Err(err) => Err(err),
    };
    info!("{}", interface.diagnostic_string());

    // Shutdown joins the reactor thread, so keep it off the async workers.
    tokio::task::spawn_blocking(move || interface.shutdown())
        .await
        .context("shutdown task failed")?;

    let response = outcome.context("command failed")?;
    println!("{}", serde_json::to_string(&response)?);
    Ok(())
}

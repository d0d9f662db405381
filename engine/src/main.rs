use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use orgx_cloud::{CloudClient, HttpCloudClient};
use orgx_local::Outbox;
use orgx_server::{serve, AppState, Config};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "orgx-engine")]
#[command(about = "Headless OrgX local control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the `/orgx` HTTP server until interrupted.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4173)]
        port: u16,
        #[arg(long, env = "ORGX_CLOUD_URL")]
        cloud_url: String,
        #[arg(long, env = "ORGX_CLOUD_TOKEN")]
        cloud_token: Option<String>,
        #[arg(long, env = "ORGX_AGENT_PROGRAM", default_value = "openclaw")]
        agent_program: String,
    },
    /// Prints the current auto-continue status for one initiative, the way
    /// `/orgx/api/mission-control/auto-continue/status` would, without
    /// standing up the HTTP server.
    Status {
        #[arg(long)]
        initiative: String,
        #[arg(long, env = "ORGX_CLOUD_URL")]
        cloud_url: String,
        #[arg(long, env = "ORGX_CLOUD_TOKEN")]
        cloud_token: Option<String>,
    },
    /// Re-attempts every outbox entry queued for one initiative against the
    /// cloud plane. The outbox is best-effort and non-durable; this is an
    /// operational nudge, not a guaranteed drain.
    ReplayOutbox {
        #[arg(long)]
        initiative: String,
        #[arg(long, env = "ORGX_CLOUD_URL")]
        cloud_url: String,
        #[arg(long, env = "ORGX_CLOUD_TOKEN")]
        cloud_token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            cloud_url,
            cloud_token,
            agent_program,
        } => {
            let config = Config::from_env();
            let cloud = Arc::new(HttpCloudClient::new(cloud_url, cloud_token));
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = AppState::new(config, cloud, agent_program, Vec::new()).await;
            log_startup_paths(&state, &addr);
            serve(addr, state).await?;
        }
        Command::Status {
            initiative,
            cloud_url,
            cloud_token,
        } => {
            let config = Config::from_env();
            let cloud = Arc::new(HttpCloudClient::new(cloud_url, cloud_token));
            let state = AppState::new(config, cloud, "openclaw".to_string(), Vec::new()).await;
            match state.scheduler.status(&initiative).await {
                Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                None => println!("no auto-continue run recorded for {initiative}"),
            }
        }
        Command::ReplayOutbox {
            initiative,
            cloud_url,
            cloud_token,
        } => {
            let config = Config::from_env();
            let cloud: Arc<dyn CloudClient> = Arc::new(HttpCloudClient::new(cloud_url, cloud_token));
            let outbox = Outbox::new(config.state_dir.join("outbox"));
            let items = outbox.read_all(&initiative).await;
            let mut replayed = 0usize;
            let mut failed = 0usize;
            for item in &items {
                match cloud.emit_activity(item.payload.clone()).await {
                    Ok(()) => replayed += 1,
                    Err(err) => {
                        failed += 1;
                        tracing::warn!(item_id = %item.id, error = %err, "outbox replay failed");
                    }
                }
            }
            println!("replayed {replayed}/{} outbox entries for {initiative} ({failed} failed)", items.len());
        }
    }

    Ok(())
}

fn log_startup_paths(state: &AppState, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting orgx-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state.config.state_dir.display(),
    );
}

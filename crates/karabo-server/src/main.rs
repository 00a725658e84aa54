//! # karabo-server
//!
//! Hosts devices on the broker named by `KARABO_BROKER`.
//!
//! ```text
//! karabo-server serverId=<id> [deviceClasses=<csv>] [visibility=<0..4>]
//!               [Logger.priority=<level>] [init=<json>] [pluginDirectory=<path>]
//!               [heartbeatInterval=<seconds>] [scanPlugins=<bool>] [timeServerId=<id>]
//! ```
//!
//! ## Exit codes
//!
//! - 0: clean shutdown (Ctrl+C or `slotKillServer`)
//! - 1: startup failure (bad arguments, broker unreachable, plugin load error)
//! - 2: fatal runtime error

use std::process::ExitCode;

use anyhow::{Context, Result};
use karabo_bus::BrokerConfig;
use karabo_core::{DeviceServer, ServerConfig};
use karabo_server::{builtin_registry, init_logging};
use tracing::{error, info};

async fn start(config: ServerConfig) -> Result<DeviceServer> {
    let broker_config = BrokerConfig::from_env();
    let broker = karabo_bus::connect(&broker_config)
        .await
        .with_context(|| format!("connecting to {}", broker_config.urls.join(",")))?;
    info!(urls = ?broker_config.urls, topic = %broker_config.topic, "Broker connected");

    let server = DeviceServer::new(config, builtin_registry(), broker);
    server
        .start()
        .await
        .with_context(|| format!("starting {}", server.server_id()))?;
    Ok(server)
}

async fn run(server: DeviceServer) -> ExitCode {
    tokio::select! {
        () = server.wait_for_shutdown() => {
            info!(server_id = %server.server_id(), "Server killed remotely");
            ExitCode::SUCCESS
        }
        signal = tokio::signal::ctrl_c() => {
            server.shutdown().await;
            match signal {
                Ok(()) => {
                    info!(server_id = %server.server_id(), "Interrupted");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Signal handling failed");
                    ExitCode::from(2)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ServerConfig::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("karabo-server: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = init_logging(&config.log_priority) {
        eprintln!("karabo-server: {e:#}");
        return ExitCode::from(1);
    }

    let server = match start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Startup failed");
            return ExitCode::from(1);
        }
    };
    info!("Server is running. Press Ctrl+C to stop.");

    let server_task = tokio::spawn(run(server));
    match server_task.await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Server task failed");
            ExitCode::from(2)
        }
    }
}

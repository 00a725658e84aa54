//! # karabo-broker
//!
//! Standalone TCP hub for `tcp://` broker URLs.
//!
//! ```text
//! karabo-broker [host:port]      (default 0.0.0.0:7777)
//! ```

use std::process::ExitCode;

use karabo_bus::BrokerHub;
use karabo_server::init_logging;
use tracing::{error, info};

const DEFAULT_ADDRESS: &str = "0.0.0.0:7777";

#[tokio::main]
async fn main() -> ExitCode {
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    if let Err(e) = init_logging("INFO") {
        eprintln!("karabo-broker: {e:#}");
        return ExitCode::from(1);
    }

    let hub = match BrokerHub::bind(&address).await {
        Ok(hub) => hub,
        Err(e) => {
            error!(address = %address, error = %e, "Cannot listen");
            return ExitCode::from(1);
        }
    };
    info!(url = %hub.url(), "Broker running. Press Ctrl+C to stop.");

    let code = match tokio::signal::ctrl_c().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Signal handling failed");
            ExitCode::from(2)
        }
    };
    info!(connections = hub.connection_count(), "Broker stopping");
    hub.shutdown();
    code
}

mod control_channel;

pub use control_channel::{run_client_session, SessionEnd};

use crate::config::ClientConfig;
use crate::observer::RelayStatusObserver;
use anyhow::Result;
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 运行拨号端（带自动重连），直到被取消
pub async fn run_client(
    config: ClientConfig,
    status: Arc<dyn RelayStatusObserver>,
    shutdown: CancellationToken,
) -> Result<()> {
    let delay = config.reconnect_delay();

    loop {
        info!("Starting relay client...");

        tokio::select! {
            result = run_client_session(&config, status.as_ref()) => {
                match result {
                    Ok(end) => info!("Relay session ended: {:?}", end),
                    Err(e) => error!("Relay session error: {}", e),
                }
            }
            _ = shutdown.cancelled() => break,
        }

        warn!("Reconnecting in {} seconds...", delay.as_secs());
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    status.on_relay_status("No relay client connected", false);
    info!("Relay client stopped");
    Ok(())
}

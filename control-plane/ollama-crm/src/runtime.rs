use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{config::CrmConfig, controller::run_controller};

/// Spawn the Kubernetes controller loop; it stops once `shutdown` fires.
pub fn spawn_controller(
    client: Client,
    cfg: CrmConfig,
    shutdown: CancellationToken,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { run_controller(client, cfg, shutdown).await })
}

/// Run the controller until it exits or the process receives Ctrl-C.
pub async fn run_all(client: Client, cfg: CrmConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "unable to listen for shutdown signal"),
        }
    });

    let controller = spawn_controller(client, cfg, shutdown);
    controller.await??;
    Ok(())
}

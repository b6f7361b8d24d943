//! OBD Gateway - Main Entry Point

use std::sync::Arc;

use gateway::{init_logging, GatewayService, GatewaySettings};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = GatewaySettings::load()?;
    init_logging(settings.log_json)?;

    info!("=== OBD Gateway v{} ===", env!("CARGO_PKG_VERSION"));
    let service = Arc::new(GatewayService::new(settings.clone()));

    if settings.auto_connect {
        match settings.adapter_target() {
            Some(target) => {
                if let Err(e) = service.connect(target).await {
                    error!("Auto-connect failed: {}", e);
                }
            }
            None => warn!("auto_connect is set but no wifi_host or serial_device is configured"),
        }
    }

    if settings.auto_tunnel {
        match settings.credentials() {
            Some((shop_id, api_key)) => service.start_tunnel(&shop_id, &api_key)?,
            None => warn!("auto_tunnel is set but shop_id/api_key are missing"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.stop_tunnel();
    service.disconnect().await;
    Ok(())
}

//! Session orchestrator.
//!
//! Owns at most one adapter session (connection, engine, keepalive task)
//! and at most one tunnel. Multi-step engine operations are serialized
//! through a single operation lock.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};

use obd_protocol::{AdapterCapabilities, AdapterTarget, Connection, ProtocolEngine};
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::GatewayError;
use crate::keepalive;
use crate::settings::GatewaySettings;
use crate::tunnel;

struct Session {
    engine: Arc<ProtocolEngine>,
    keepalive: JoinHandle<()>,
}

struct TunnelHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct GatewayService {
    settings: GatewaySettings,
    session: RwLock<Option<Session>>,
    op_lock: Arc<Mutex<()>>,
    tunnel: StdMutex<Option<TunnelHandle>>,
}

impl GatewayService {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings,
            session: RwLock::new(None),
            op_lock: Arc::new(Mutex::new(())),
            tunnel: StdMutex::new(None),
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Open `target`, initialize the adapter and detect its capabilities.
    ///
    /// Any previous session is closed first.
    pub async fn connect(&self, target: AdapterTarget) -> Result<AdapterCapabilities, GatewayError> {
        self.disconnect().await;
        let conn = match Connection::connect(target).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Adapter connection failed: {}", e);
                return Err(e.into());
            }
        };
        Ok(self.attach(conn).await)
    }

    /// Connect to a WiFi adapter.
    pub async fn connect_wifi(&self, host: &str, port: u16) -> Result<AdapterCapabilities, GatewayError> {
        self.connect(AdapterTarget::Tcp {
            host: host.to_string(),
            port,
        })
        .await
    }

    /// Adopt an already initialized connection as the current session.
    pub async fn attach(&self, conn: Connection) -> AdapterCapabilities {
        let _op = self.op_lock.lock().await;
        let engine = Arc::new(ProtocolEngine::new(Arc::new(conn)));
        let caps = engine.detect_adapter().await;

        let keepalive = keepalive::spawn(
            engine.clone(),
            self.op_lock.clone(),
            self.settings.keepalive_idle(),
            self.settings.keepalive_interval(),
        );

        let previous = self.session.write().await.replace(Session { engine, keepalive });
        if let Some(previous) = previous {
            close_session(previous).await;
        }
        info!(adapter = %caps.device_name, "Session established");
        caps
    }

    /// Close the current session. Safe to call at any time.
    pub async fn disconnect(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            close_session(session).await;
            info!("Session closed");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.engine.connection().is_connected())
    }

    /// The live engine, or `NotConnected`
    pub async fn engine(&self) -> Result<Arc<ProtocolEngine>, GatewayError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.engine.clone())
            .filter(|engine| engine.connection().is_connected())
            .ok_or(GatewayError::NotConnected)
    }

    /// Engine plus the operation lock, held for the whole multi-step operation.
    pub async fn exclusive(&self) -> Result<(MutexGuard<'_, ()>, Arc<ProtocolEngine>), GatewayError> {
        let guard = self.op_lock.lock().await;
        let engine = self.engine().await?;
        Ok((guard, engine))
    }

    /// Connect to the shop server and serve tunnel requests in the
    /// background. A running tunnel is replaced.
    pub fn start_tunnel(self: &Arc<Self>, shop_id: &str, api_key: &str) -> Result<(), GatewayError> {
        let url = self
            .settings
            .server_url
            .clone()
            .ok_or_else(|| GatewayError::Settings("server_url is not configured".into()))?;
        if shop_id.is_empty() || api_key.is_empty() {
            return Err(GatewayError::Settings("shop id and api key are required".into()));
        }
        self.stop_tunnel();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let service = self.clone();
        let registration = tunnel::Registration::new(shop_id, api_key);
        let task = tokio::spawn(async move {
            match tunnel::run(service, &url, registration, shutdown_rx).await {
                Ok(()) => info!("Tunnel closed"),
                Err(e) => error!("Tunnel failed: {}", e),
            }
        });

        *self.tunnel_slot() = Some(TunnelHandle { shutdown, task });
        Ok(())
    }

    pub fn stop_tunnel(&self) {
        if let Some(handle) = self.tunnel_slot().take() {
            if handle.shutdown.send(true).is_err() {
                // Task already gone
                handle.task.abort();
            }
            info!("Tunnel stop requested");
        }
    }

    pub fn is_tunnel_running(&self) -> bool {
        self.tunnel_slot().as_ref().is_some_and(|h| !h.task.is_finished())
    }

    fn tunnel_slot(&self) -> StdMutexGuard<'_, Option<TunnelHandle>> {
        self.tunnel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn close_session(session: Session) {
    session.engine.stop_scope();
    session.keepalive.abort();
    session.engine.connection().disconnect().await;
    if let Err(e) = session.keepalive.await {
        if !e.is_cancelled() {
            warn!("Keepalive task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use obd_protocol::mock::MockAdapter;

    use super::*;

    pub(crate) async fn connected_service(adapter: &MockAdapter) -> Arc<GatewayService> {
        let service = Arc::new(GatewayService::new(GatewaySettings::default()));
        let conn = adapter.connection();
        conn.initialize().await.unwrap();
        service.attach(conn).await;
        adapter.clear_log();
        service
    }

    #[tokio::test]
    async fn test_not_connected_by_default() {
        let service = GatewayService::new(GatewaySettings::default());
        assert!(!service.is_connected().await);
        assert!(matches!(service.engine().await, Err(GatewayError::NotConnected)));
        service.disconnect().await;
    }

    #[tokio::test]
    async fn test_attach_detects_and_disconnect_closes() {
        let adapter = MockAdapter::new();
        let service = connected_service(&adapter).await;
        assert!(service.is_connected().await);

        let engine = service.engine().await.unwrap();
        assert_eq!(engine.capabilities().device_name, "ELM327");

        service.disconnect().await;
        assert!(!service.is_connected().await);
        assert!(!engine.connection().is_connected());
        // Second disconnect is a no-op
        service.disconnect().await;
    }

    #[tokio::test]
    async fn test_tunnel_requires_server_url() {
        let service = Arc::new(GatewayService::new(GatewaySettings::default()));
        assert!(matches!(
            service.start_tunnel("shop", "key"),
            Err(GatewayError::Settings(_))
        ));
        assert!(!service.is_tunnel_running());
        service.stop_tunnel();
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_session() {
        let service = GatewayService::new(GatewaySettings::default());
        let result = service
            .connect(AdapterTarget::Serial {
                path: "/dev/nonexistent-obd-adapter".into(),
                baud_rate: 38400,
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Obd(_))));
        assert!(!service.is_connected().await);
    }
}

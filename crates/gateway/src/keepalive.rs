//! Idle keepalive: read the battery voltage when nothing else has talked
//! to the adapter for a while, so WiFi/BT adapters do not go to sleep.

use std::sync::Arc;
use std::time::Duration;

use obd_protocol::{ObdError, ProtocolEngine};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Spawn the keepalive task. It exits once the connection is closed.
///
/// `op_lock` is the orchestrator's operation lock; a tick that finds it
/// held is skipped.
pub fn spawn(
    engine: Arc<ProtocolEngine>,
    op_lock: Arc<Mutex<()>>,
    idle: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(run(engine, op_lock, idle, interval))
}

async fn run(engine: Arc<ProtocolEngine>, op_lock: Arc<Mutex<()>>, idle: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let conn = engine.connection();
        if !conn.is_connected() {
            break;
        }
        if conn.idle_time() < idle || engine.is_loop_running() {
            continue;
        }
        let Ok(_op) = op_lock.try_lock() else {
            continue;
        };

        match engine.battery_voltage().await {
            Ok(Some(volts)) => debug!(volts, "Keepalive"),
            Ok(None) => debug!("Keepalive: no voltage reading"),
            Err(ObdError::NotConnected) => break,
            Err(e) => warn!("Keepalive failed: {}", e),
        }
    }
    info!("Keepalive stopped");
}

#[cfg(test)]
mod tests {
    use obd_protocol::mock::MockAdapter;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_polls_only_when_idle_and_stops_on_disconnect() {
        let adapter = MockAdapter::new();
        adapter.respond("ATRV", "12.4V");
        let conn = Arc::new(adapter.connection());
        conn.initialize().await.unwrap();
        adapter.clear_log();
        let engine = Arc::new(ProtocolEngine::new(conn.clone()));

        let handle = spawn(
            engine,
            Arc::new(Mutex::new(())),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(adapter.count("ATRV"), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(adapter.count("ATRV"), 1);

        conn.disconnect().await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_while_operation_in_progress() {
        let adapter = MockAdapter::new();
        let conn = Arc::new(adapter.connection());
        conn.initialize().await.unwrap();
        adapter.clear_log();
        let engine = Arc::new(ProtocolEngine::new(conn.clone()));
        let op_lock = Arc::new(Mutex::new(()));

        let _busy = op_lock.lock().await;
        let handle = spawn(engine, op_lock.clone(), Duration::from_secs(1), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(adapter.count("ATRV"), 0);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_adapter_channel_drops() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let conn = Arc::new(obd_protocol::Connection::from_stream(
            obd_protocol::TransportKind::Tcp,
            client,
        ));
        let engine = Arc::new(ProtocolEngine::new(conn.clone()));

        let handle = spawn(
            engine,
            Arc::new(Mutex::new(())),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!conn.is_connected());
        assert!(handle.is_finished());
    }
}

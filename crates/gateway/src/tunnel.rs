//! Outbound WebSocket tunnel to the shop server.
//!
//! After connecting, one `register` message identifies the shop; every
//! text frame after that is a [`TunnelRequest`](crate::routes::TunnelRequest)
//! answered in order. The tunnel ends on shutdown, on a close frame, or on
//! the first socket error. It does not reconnect.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::routes;
use crate::service::GatewayService;

/// First message sent on the socket
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    #[serde(rename = "type")]
    kind: &'static str,
    shop_id: String,
    api_key: String,
    version: &'static str,
}

impl Registration {
    pub fn new(shop_id: &str, api_key: &str) -> Self {
        Self {
            kind: "register",
            shop_id: shop_id.to_string(),
            api_key: api_key.to_string(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Serve tunnel requests until shutdown or until the server goes away.
pub async fn run(
    service: Arc<GatewayService>,
    url: &str,
    registration: Registration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    info!(url, "Opening tunnel");
    let (socket, _) = connect_async(url).await?;
    let (mut write, mut read) = socket.split();

    write
        .send(Message::Text(serde_json::to_string(&registration)?))
        .await?;
    info!(shop = %registration.shop_id, "Tunnel registered");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!("Close frame not sent: {}", e);
                }
                break;
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let response = routes::handle_text(&service, &text).await;
                    write.send(Message::Text(serde_json::to_string(&response)?)).await?;
                }
                Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Server closed tunnel");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Tunnel read failed: {}", e);
                    return Err(e.into());
                }
                None => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use obd_protocol::mock::MockAdapter;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;
    use crate::service::tests::connected_service;

    #[test]
    fn test_registration_shape() {
        let value = serde_json::to_value(Registration::new("shop-7", "secret")).unwrap();
        assert_eq!(value["type"], json!("register"));
        assert_eq!(value["shopId"], json!("shop-7"));
        assert_eq!(value["apiKey"], json!("secret"));
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let register: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected {other:?}"),
            };
            let request = json!({ "id": 7, "method": "GET", "path": "/vin" });
            ws.send(Message::Text(request.to_string())).await.unwrap();
            let response: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected {other:?}"),
            };
            ws.close(None).await.unwrap();
            (register, response)
        });

        let adapter = MockAdapter::new();
        adapter.respond("0902", "014\n0:490201314654\n1:46573145543544\n2:46433130333132");
        let service = connected_service(&adapter).await;
        let (_tx, rx) = watch::channel(false);

        run(service, &url, Registration::new("shop-7", "secret"), rx)
            .await
            .unwrap();

        let (register, response) = server.await.unwrap();
        assert_eq!(register["shopId"], json!("shop-7"));
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["status"], json!(200));
        assert_eq!(response["body"]["vin"], json!("1FTFW1ET5DFC10312"));
        assert_eq!(response["body"]["manufacturer"], json!("Ford"));
    }
}

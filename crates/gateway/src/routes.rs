//! Tunnel request routing.
//!
//! Each logical endpoint maps onto one engine operation. Handlers return a
//! JSON body; errors become `{ "error": .. }` with the matching status.

use obd_protocol::engine::module_by_name;
use obd_protocol::uds::parse_did;
use obd_protocol::vin::decode_vin;
use obd_protocol::{EcuModule, ProtocolEngine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::service::GatewayService;

/// `{ "id", "method", "path", "body" }`
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Value,
}

/// `{ "id", "status", "body" }`
#[derive(Debug, Clone, Serialize)]
pub struct TunnelResponse {
    pub id: Value,
    pub status: u16,
    pub body: Value,
}

impl TunnelResponse {
    pub fn ok(id: Value, body: Value) -> Self {
        Self { id, status: 200, body }
    }

    pub fn error(id: Value, err: &GatewayError) -> Self {
        Self {
            id,
            status: err.status(),
            body: json!({ "error": err.to_string() }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadDidBody {
    module: String,
    dids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PidsBody {
    names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct UdsRawBody {
    module: String,
    command: String,
}

/// Route one request and always produce a response.
pub async fn handle(service: &GatewayService, request: TunnelRequest) -> TunnelResponse {
    debug!(method = %request.method, path = %request.path, "Tunnel request");
    match dispatch(service, &request.path, request.body).await {
        Ok(body) => TunnelResponse::ok(request.id, body),
        Err(err) => {
            info!(path = %request.path, status = err.status(), "Tunnel request failed: {}", err);
            TunnelResponse::error(request.id, &err)
        }
    }
}

/// Parse raw tunnel text; malformed JSON yields a 400 with a null id.
pub async fn handle_text(service: &GatewayService, text: &str) -> TunnelResponse {
    match serde_json::from_str::<TunnelRequest>(text) {
        Ok(request) => handle(service, request).await,
        Err(e) => TunnelResponse::error(Value::Null, &GatewayError::Json(e)),
    }
}

async fn dispatch(service: &GatewayService, path: &str, body: Value) -> Result<Value, GatewayError> {
    match path.trim_end_matches('/') {
        "/status" => status(service).await,
        "/version" => version(service).await,
        "/vin" => {
            let (_op, engine) = service.exclusive().await?;
            let vin = engine.read_vin().await?;
            Ok(match vin {
                Some(vin) => {
                    let info = decode_vin(&vin);
                    json!({
                        "vin": vin,
                        "manufacturer": info.manufacturer,
                        "modelYear": info.model_year,
                        "valid": info.valid,
                    })
                }
                None => json!({ "vin": null }),
            })
        }
        "/dtcs" => {
            let (_op, engine) = service.exclusive().await?;
            let dtcs = engine.read_all_dtcs().await?;
            Ok(json!({ "count": dtcs.len(), "dtcs": dtcs }))
        }
        "/clear-dtcs" => {
            let (_op, engine) = service.exclusive().await?;
            Ok(json!({ "cleared": engine.clear_dtcs().await? }))
        }
        "/modules" => {
            let (_op, engine) = service.exclusive().await?;
            Ok(json!({ "modules": engine.discover_modules().await? }))
        }
        "/read-did" => {
            let body: ReadDidBody = parse_body(body)?;
            let dids = body
                .dids
                .iter()
                .map(|d| parse_did(d).ok_or_else(|| GatewayError::BadRequest(format!("invalid DID '{d}'"))))
                .collect::<Result<Vec<_>, _>>()?;
            if dids.is_empty() {
                return Err(GatewayError::BadRequest("dids must not be empty".into()));
            }
            let (_op, engine) = service.exclusive().await?;
            let module = resolve_module(&engine, &body.module)?;
            let results = engine.read_dids(&module, &dids).await?;
            Ok(json!({ "module": module, "results": results }))
        }
        "/pids" => {
            let body: PidsBody = if body.is_null() { PidsBody::default() } else { parse_body(body)? };
            let (_op, engine) = service.exclusive().await?;
            match body.names {
                Some(names) => Ok(json!({ "readings": engine.read_pids(&names).await? })),
                None => {
                    let supported: Vec<String> = engine
                        .get_supported_pids()
                        .await?
                        .iter()
                        .map(|pid| format!("{pid:02X}"))
                        .collect();
                    Ok(json!({ "supported": supported }))
                }
            }
        }
        "/uds-raw" => {
            let body: UdsRawBody = parse_body(body)?;
            let (_op, engine) = service.exclusive().await?;
            let module = resolve_module(&engine, &body.module)?;
            match engine.send_uds_raw(&module, &body.command).await? {
                Some(response) => Ok(json!({ "module": module, "response": response })),
                None => Err(GatewayError::Obd(obd_protocol::ObdError::Transport(format!(
                    "{} is not reachable",
                    module.bus
                )))),
            }
        }
        "/snapshot" => {
            let (_op, engine) = service.exclusive().await?;
            Ok(serde_json::to_value(engine.snapshot().await?)?)
        }
        "/reset-adapter" => {
            let (_op, engine) = service.exclusive().await?;
            Ok(json!({ "capabilities": engine.reset_adapter().await? }))
        }
        _ => Err(GatewayError::NotFound(path.to_string())),
    }
}

async fn status(service: &GatewayService) -> Result<Value, GatewayError> {
    let (_op, engine) = match service.exclusive().await {
        Ok(pair) => pair,
        Err(GatewayError::NotConnected) => return Ok(json!({ "connected": false })),
        Err(e) => return Err(e),
    };

    let voltage = engine.battery_voltage().await?;
    let conn = engine.connection();
    Ok(json!({
        "connected": true,
        "transport": conn.kind().to_string(),
        "adapter": conn.identity(),
        "capabilities": engine.capabilities(),
        "bus": engine.current_bus(),
        "voltage": voltage,
        "idleMs": conn.idle_time().as_millis() as u64,
    }))
}

async fn version(service: &GatewayService) -> Result<Value, GatewayError> {
    let mut body = json!({ "gateway": env!("CARGO_PKG_VERSION") });
    if let Ok(engine) = service.engine().await {
        let caps = engine.capabilities();
        body["adapter"] = json!(engine.connection().adapter_name());
        body["firmware"] = json!(caps.firmware_version);
        body["device"] = json!(caps.device_name);
    }
    Ok(body)
}

fn parse_body<T: DeserializeOwned>(body: Value) -> Result<T, GatewayError> {
    serde_json::from_value(body).map_err(|e| GatewayError::BadRequest(e.to_string()))
}

/// Discovered modules first, then the known tables, then a hex request
/// address on the primary bus.
fn resolve_module(engine: &ProtocolEngine, name: &str) -> Result<EcuModule, GatewayError> {
    if let Some(module) = engine
        .modules()
        .into_iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
    {
        return Ok(module);
    }
    if let Some(module) = module_by_name(name) {
        return Ok(module);
    }
    let hex = name.trim_start_matches("0x").trim_start_matches("0X");
    match u16::from_str_radix(hex, 16) {
        Ok(addr) if (0x700..=0x7F7).contains(&addr) => Ok(EcuModule::new(
            format!("ECU_0x{addr:03X}"),
            addr,
            obd_protocol::Bus::HsCan,
        )),
        _ => Err(GatewayError::BadRequest(format!("unknown module '{name}'"))),
    }
}

#[cfg(test)]
mod tests {
    use obd_protocol::mock::MockAdapter;

    use super::*;
    use crate::service::tests::connected_service;
    use crate::settings::GatewaySettings;

    fn request(path: &str, body: Value) -> TunnelRequest {
        TunnelRequest {
            id: json!("req-1"),
            method: "POST".into(),
            path: path.into(),
            body,
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let service = GatewayService::new(GatewaySettings::default());
        let response = handle(&service, request("/nope", Value::Null)).await;
        assert_eq!(response.status, 404);
        assert_eq!(response.id, json!("req-1"));
    }

    #[tokio::test]
    async fn test_not_connected_is_500_but_status_answers() {
        let service = GatewayService::new(GatewaySettings::default());
        assert_eq!(handle(&service, request("/dtcs", Value::Null)).await.status, 500);

        let status = handle(&service, request("/status", Value::Null)).await;
        assert_eq!(status.status, 200);
        assert_eq!(status.body["connected"], json!(false));

        let version = handle(&service, request("/version", Value::Null)).await;
        assert_eq!(version.body["gateway"], json!(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn test_malformed_text_is_400() {
        let service = GatewayService::new(GatewaySettings::default());
        let response = handle_text(&service, "{not json").await;
        assert_eq!(response.status, 400);
        assert!(response.id.is_null());
    }

    #[tokio::test]
    async fn test_status_and_dtcs() {
        let adapter = MockAdapter::new();
        adapter.respond("ATRV", "12.6V");
        adapter.respond("03", "43010133");
        let service = connected_service(&adapter).await;

        let status = handle(&service, request("/status", Value::Null)).await;
        assert_eq!(status.status, 200);
        assert_eq!(status.body["connected"], json!(true));
        assert_eq!(status.body["voltage"], json!(12.6));
        assert_eq!(status.body["bus"], json!("HS-CAN"));

        let dtcs = handle(&service, request("/dtcs", Value::Null)).await;
        assert_eq!(dtcs.body["count"], json!(1));
        assert_eq!(dtcs.body["dtcs"][0]["code"], json!("P0133"));
    }

    #[tokio::test]
    async fn test_read_did_validation_and_success() {
        let adapter = MockAdapter::new();
        adapter.respond("22F190", "62F190314654465731455435444643313033313200");
        let service = connected_service(&adapter).await;

        let bad = handle(&service, request("/read-did", json!({ "module": "PCM" }))).await;
        assert_eq!(bad.status, 400);
        let bad = handle(&service, request("/read-did", json!({ "module": "PCM", "dids": ["XYZ"] }))).await;
        assert_eq!(bad.status, 400);
        let bad = handle(&service, request("/read-did", json!({ "module": "NOPE", "dids": ["F190"] }))).await;
        assert_eq!(bad.status, 400);

        let ok = handle(&service, request("/read-did", json!({ "module": "pcm", "dids": ["F190"] }))).await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body["module"]["requestAddress"], json!(0x7E0));
        assert_eq!(ok.body["results"][0]["did"], json!("F190"));
        assert_eq!(adapter.count("ATSH7E0"), 1);
    }

    #[tokio::test]
    async fn test_pids_by_name_and_supported() {
        let adapter = MockAdapter::new();
        adapter.respond("010C", "410C1AF8");
        adapter.respond("0100", "4100BE3FA812");
        let service = connected_service(&adapter).await;

        let readings = handle(&service, request("/pids", json!({ "names": ["RPM"] }))).await;
        assert_eq!(readings.body["readings"][0]["name"], json!("RPM"));

        let supported = handle(&service, request("/pids", Value::Null)).await;
        let list = supported.body["supported"].as_array().unwrap();
        assert_eq!(list[0], json!("01"));
        assert!(list.contains(&json!("0C")));
    }

    #[tokio::test]
    async fn test_uds_raw_to_hex_address() {
        let adapter = MockAdapter::new();
        adapter.respond("3E00", "7E00");
        let service = connected_service(&adapter).await;

        let response = handle(&service, request("/uds-raw", json!({ "module": "7E3", "command": "3E00" }))).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body["response"], json!("7E00"));
        assert_eq!(response.body["module"]["name"], json!("ECU_0x7E3"));

        let bad = handle(&service, request("/uds-raw", json!({ "module": "7E3", "command": "3Z" }))).await;
        assert_eq!(bad.status, 400);
    }
}

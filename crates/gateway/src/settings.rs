//! Gateway settings.
//!
//! Loaded from an optional TOML file (`obd-gateway.toml`, or the path in
//! `OBD_GATEWAY_CONFIG`) and then from `OBD_GATEWAY__*` environment
//! variables, which win.

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use obd_protocol::AdapterTarget;
use serde::Deserialize;

use crate::error::GatewayError;

pub const DEFAULT_CONFIG_FILE: &str = "obd-gateway.toml";
pub const CONFIG_PATH_VAR: &str = "OBD_GATEWAY_CONFIG";
pub const ENV_PREFIX: &str = "OBD_GATEWAY";

/// Port used by most WiFi ELM327 clones
pub const DEFAULT_WIFI_PORT: u16 = 35000;
pub const DEFAULT_BAUD_RATE: u32 = 38400;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub shop_id: Option<String>,
    pub api_key: Option<String>,
    /// WebSocket endpoint of the shop server
    pub server_url: Option<String>,
    pub wifi_host: Option<String>,
    pub wifi_port: u16,
    pub serial_device: Option<String>,
    pub baud_rate: u32,
    pub auto_connect: bool,
    pub auto_tunnel: bool,
    pub keepalive_idle_secs: u64,
    pub keepalive_interval_secs: u64,
    pub log_json: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            shop_id: None,
            api_key: None,
            server_url: None,
            wifi_host: None,
            wifi_port: DEFAULT_WIFI_PORT,
            serial_device: None,
            baud_rate: DEFAULT_BAUD_RATE,
            auto_connect: false,
            auto_tunnel: false,
            keepalive_idle_secs: 30,
            keepalive_interval_secs: 10,
            log_json: false,
        }
    }
}

impl GatewaySettings {
    /// Load from the default file location and the process environment.
    pub fn load() -> Result<Self, GatewayError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_sources(Some(&path), Environment::with_prefix(ENV_PREFIX))
    }

    /// Build from an optional TOML file and an environment source.
    pub fn from_sources(file: Option<&str>, env: Environment) -> Result<Self, GatewayError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(false));
        }
        let settings: Self = builder
            .add_source(env.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.keepalive_interval_secs == 0 {
            return Err(GatewayError::Settings("keepalive_interval_secs must be positive".into()));
        }
        if self.wifi_port == 0 {
            return Err(GatewayError::Settings("wifi_port must be positive".into()));
        }
        Ok(())
    }

    /// Adapter to open on startup: WiFi wins over serial.
    pub fn adapter_target(&self) -> Option<AdapterTarget> {
        if let Some(host) = &self.wifi_host {
            return Some(AdapterTarget::Tcp {
                host: host.clone(),
                port: self.wifi_port,
            });
        }
        self.serial_device.as_ref().map(|path| AdapterTarget::Serial {
            path: path.clone(),
            baud_rate: self.baud_rate,
        })
    }

    /// Shop credentials for the tunnel, when both are configured
    pub fn credentials(&self) -> Option<(String, String)> {
        Some((self.shop_id.clone()?, self.api_key.clone()?))
    }

    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

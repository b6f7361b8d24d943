//! Module-targeted UDS requests.

use std::time::Duration;

use tracing::{debug, info};

use super::discovery::EcuModule;
use super::ProtocolEngine;
use crate::error::ObdError;
use crate::uds::{describe_nrc, parse_did_response, DidResponse, DidResult, EXTENDED_SESSION};

const UDS_TIMEOUT: Duration = Duration::from_secs(2);

impl ProtocolEngine {
    /// Read one data identifier from `module`.
    pub async fn read_did(&self, module: &EcuModule, did: u16) -> Result<Option<DidResult>, ObdError> {
        Ok(self.read_dids(module, &[did]).await?.into_iter().next())
    }

    /// Read several data identifiers in one extended session.
    ///
    /// Negative or malformed answers are skipped. The adapter is returned to
    /// broadcast addressing on the primary bus afterwards.
    pub async fn read_dids(&self, module: &EcuModule, dids: &[u16]) -> Result<Vec<DidResult>, ObdError> {
        if !self.prepare_module(module).await? {
            return Ok(Vec::new());
        }
        let result = self.query_dids(module, dids).await;
        self.release_module().await;
        result
    }

    async fn query_dids(&self, module: &EcuModule, dids: &[u16]) -> Result<Vec<DidResult>, ObdError> {
        let session = self.command(EXTENDED_SESSION, UDS_TIMEOUT).await?;
        if !session.trim_start().starts_with("50") {
            debug!(module = %module.name, response = %session, "Extended session not confirmed");
        }

        let mut results = Vec::with_capacity(dids.len());
        for did in dids {
            let response = self.command(&format!("22{did:04X}"), UDS_TIMEOUT).await?;
            match parse_did_response(&response, *did) {
                DidResponse::Value(result) => results.push(result),
                DidResponse::Negative(nrc) => debug!(
                    module = %module.name,
                    did = format!("{did:04X}"),
                    nrc = format!("{nrc:02X}"),
                    "Negative response: {}",
                    describe_nrc(nrc)
                ),
                DidResponse::Malformed => debug!(
                    module = %module.name,
                    did = format!("{did:04X}"),
                    response = %response,
                    "Unusable DID response"
                ),
            }
        }
        info!(module = %module.name, requested = dids.len(), read = results.len(), "DID read");
        Ok(results)
    }

    /// Send a raw hex UDS request to `module` and return the cleaned reply.
    ///
    /// `Ok(None)` means the module's bus could not be reached.
    pub async fn send_uds_raw(&self, module: &EcuModule, command: &str) -> Result<Option<String>, ObdError> {
        let command: String = command.chars().filter(|c| !c.is_whitespace()).collect();
        if command.is_empty() || command.len() % 2 != 0 || !command.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ObdError::InvalidArgument(format!("'{command}' is not a hex request")));
        }

        if !self.prepare_module(module).await? {
            return Ok(None);
        }
        let result = self.command(&command.to_ascii_uppercase(), UDS_TIMEOUT).await;
        self.release_module().await;
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::engine_with;
    use super::*;
    use crate::engine::Bus;
    use crate::mock::MockAdapter;

    fn abs() -> EcuModule {
        EcuModule::new("ABS", 0x760, Bus::HsCan)
    }

    #[tokio::test]
    async fn test_negative_response_does_not_stop_remaining_dids() {
        let adapter = MockAdapter::new();
        adapter.respond("1003", "50 03 00 32 01 F4");
        adapter.respond("22F190", "7F 22 31");
        adapter.respond("22F18C", "62 F1 8C 41 42 43");
        let engine = engine_with(&adapter).await;

        let results = engine.read_dids(&abs(), &[0xF190, 0xF18C]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].did, "F18C");
        assert_eq!(results[0].decoded, "ABC");
        assert_eq!(
            adapter.commands(),
            vec!["ATSH760", "ATCRA768", "1003", "22F190", "22F18C", "ATSH7DF", "ATCRA"]
        );
    }

    #[tokio::test]
    async fn test_read_did_on_secondary_bus_returns_to_primary() {
        let adapter = MockAdapter::new();
        adapter.respond("22DD01", "62DD01001234");
        let engine = engine_with(&adapter).await;
        let ipc = EcuModule::new("IPC", 0x720, Bus::MsCan);

        let result = engine.read_did(&ipc, 0xDD01).await.unwrap().unwrap();
        assert_eq!(result.raw_hex, "001234");
        assert_eq!(engine.current_bus(), Bus::HsCan);
        assert_eq!(adapter.commands().last().map(String::as_str), Some("ATSP6"));
    }

    #[tokio::test]
    async fn test_unreachable_bus_reads_nothing() {
        let adapter = MockAdapter::new();
        adapter.respond("ATSPB", "?");
        let engine = engine_with(&adapter).await;
        let ipc = EcuModule::new("IPC", 0x720, Bus::MsCan);

        assert!(engine.read_dids(&ipc, &[0xF190]).await.unwrap().is_empty());
        assert_eq!(adapter.count("22F190"), 0);
    }

    #[tokio::test]
    async fn test_raw_request() {
        let adapter = MockAdapter::new();
        adapter.respond("190209", "59 02 FF 01 23 45 09");
        let engine = engine_with(&adapter).await;

        let reply = engine.send_uds_raw(&abs(), "19 02 09").await.unwrap();
        assert_eq!(reply.as_deref(), Some("59 02 FF 01 23 45 09"));
        assert!(matches!(
            engine.send_uds_raw(&abs(), "1G").await,
            Err(ObdError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.send_uds_raw(&abs(), "190").await,
            Err(ObdError::InvalidArgument(_))
        ));
    }
}

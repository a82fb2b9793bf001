//! Virtual-duplex transport: the client dials every connection, including
//! the ones the server will later use for PUSH callbacks. Extra "secondary"
//! connections are attached to the control session up front and parked
//! server-side until a push registration claims one, so servers behind NAT
//! or a one-way firewall can still originate callbacks.

mod client;
mod server;

pub use client::BisocketClientInvoker;
pub use server::BisocketServerInvoker;

use crate::config::{parse_port_list, ParamKey, Resolver};
use crate::error::InvokeError;
use crate::locator::Locator;
use std::collections::BTreeMap;
use std::time::Duration;

pub const BISOCKET_TRANSPORT: &'static str = "bisocket";

/// Server-side knobs, resolved from the locator parameter bag
pub(crate) struct BisocketConfig {
    /// Ports the secondary listeners bind, in advertisement order
    pub bind_ports: Vec<u16>,
    /// Ports advertised to clients; defaults to `bind_ports`
    pub connect_ports: Vec<u16>,
    /// Liveness probe period for parked secondaries; zero disables
    pub ping_frequency: Duration,
    /// How long a push registration waits for a parked secondary
    pub claim_timeout: Duration,
}

impl BisocketConfig {
    pub fn from_locator(
        locator: &Locator, params: &BTreeMap<String, String>,
    ) -> Result<Self, InvokeError> {
        let resolver = Resolver::new(
            Some(&locator.params),
            Some(params),
            None,
            crate::config::OverridePolicy::LastWriter,
        );
        let bind_ports = match resolver.get(ParamKey::SecondaryBindPorts) {
            Some(s) => parse_port_list(ParamKey::SecondaryBindPorts, s)?,
            None => Vec::new(),
        };
        if bind_ports.is_empty() {
            return Err(InvokeError::config(
                "bisocket server locator needs secondary-bind-ports",
            ));
        }
        let connect_ports = match resolver.get(ParamKey::SecondaryConnectPorts) {
            Some(s) => parse_port_list(ParamKey::SecondaryConnectPorts, s)?,
            None => bind_ports.clone(),
        };
        if connect_ports.len() != bind_ports.len() {
            return Err(InvokeError::config(format!(
                "secondary-connect-ports lists {} ports but secondary-bind-ports lists {}",
                connect_ports.len(),
                bind_ports.len()
            )));
        }
        Ok(Self {
            bind_ports,
            connect_ports,
            ping_frequency: resolver
                .get_millis(ParamKey::PingFrequency)?
                .unwrap_or(Duration::ZERO),
            claim_timeout: resolver
                .get_millis(ParamKey::ClaimTimeout)?
                .unwrap_or(Duration::from_secs(5)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_config_requires_bind_ports() {
        let locator = Locator::from_str("bisocket://127.0.0.1:7800").unwrap();
        assert!(matches!(
            BisocketConfig::from_locator(&locator, &BTreeMap::new()),
            Err(InvokeError::Config(_))
        ));
    }

    #[test]
    fn test_config_port_list_mismatch() {
        let locator = Locator::from_str(
            "bisocket://127.0.0.1:7800/?secondary-bind-ports=7801,7802&secondary-connect-ports=7801",
        )
        .unwrap();
        assert!(matches!(
            BisocketConfig::from_locator(&locator, &BTreeMap::new()),
            Err(InvokeError::Config(_))
        ));
    }

    #[test]
    fn test_config_defaults() {
        let locator =
            Locator::from_str("bisocket://127.0.0.1:7800/?secondary-bind-ports=7801,7802")
                .unwrap();
        let cfg = BisocketConfig::from_locator(&locator, &BTreeMap::new()).unwrap();
        assert_eq!(cfg.bind_ports, vec![7801, 7802]);
        assert_eq!(cfg.connect_ports, vec![7801, 7802]);
        assert_eq!(cfg.ping_frequency, Duration::ZERO);
    }
}

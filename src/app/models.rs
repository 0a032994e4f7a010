use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::app::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

impl DeviceSummary {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// The device selected for this run. Every stage borrows the same instance.
#[derive(Debug)]
pub struct Device {
    serial: String,
    abi: OnceLock<String>,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            abi: OnceLock::new(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Returns the architecture tag, running `probe` only on first use.
    pub fn abi_or_probe(
        &self,
        probe: impl FnOnce() -> Result<String, AppError>,
    ) -> Result<String, AppError> {
        if let Some(abi) = self.abi.get() {
            return Ok(abi.clone());
        }
        let abi = probe()?;
        Ok(self.abi.get_or_init(|| abi).clone())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ListeningSocket {
    pub proto: String,
    pub local_address: String,
    pub pid: Option<u32>,
    pub program: String,
}

/// What the device's listening-socket table says about its boot state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ServiceTable {
    pub stable_services: bool,
    pub instrumentation_server: bool,
}

impl ServiceTable {
    /// System services are up but the instrumentation server is not: a leftover
    /// boot state that only a reboot clears.
    pub fn needs_reboot(&self) -> bool {
        self.stable_services && !self.instrumentation_server
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConnectivityStatus {
    pub default_network: Option<String>,
    /// `DETAILED/SIMPLE` token, e.g. `CONNECTED/CONNECTED`.
    pub state: Option<String>,
}

impl ConnectivityStatus {
    pub fn is_connected(&self) -> bool {
        self.state.as_deref() == Some("CONNECTED/CONNECTED")
    }
}

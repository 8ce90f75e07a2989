use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::IpAddr;
use tracing::info;

/// Opaque handle returned by a successful driver open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverHandle(pub u32);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WifiMode {
    /// Join the configured access point.
    #[default]
    Default,
    /// Host an access point for credential provisioning.
    SoftAp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub security_type: u8,
    pub ssid: String,
    pub key: String,
}

/// Notifications from the network driver, delivered through
/// [`NetworkDriver::poll_events`] instead of registered callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    ConnectionChanged(ConnectionState),
    AddressAssigned(IpAddr),
    TimeSynced(DateTime<Utc>),
    ProvisioningResult {
        credentials: WifiCredentials,
        success: bool,
    },
}

pub trait NetworkDriver {
    fn is_ready(&mut self) -> bool;
    fn open(&mut self) -> Option<DriverHandle>;
    fn enable_time_sync(&mut self, handle: DriverHandle, ntp_host: &str);
    /// Start association (or soft-AP provisioning) and address configuration.
    /// `credentials` are the last ones stored, if any.
    fn start(&mut self, handle: DriverHandle, mode: WifiMode, credentials: Option<&WifiCredentials>);
    fn poll_events(&mut self) -> Vec<DriverEvent>;
}

/// Driver for hosted builds where the operating system owns the radio.
///
/// Ready and associated as soon as it is started; time comes from the
/// system clock.
#[derive(Debug, Default)]
pub struct HostDriver {
    pending: VecDeque<DriverEvent>,
}

impl HostDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetworkDriver for HostDriver {
    fn is_ready(&mut self) -> bool {
        true
    }

    fn open(&mut self) -> Option<DriverHandle> {
        Some(DriverHandle(0))
    }

    fn enable_time_sync(&mut self, _handle: DriverHandle, ntp_host: &str) {
        info!(ntp_host = %ntp_host, "Network time provided by the host clock");
        self.pending.push_back(DriverEvent::TimeSynced(Utc::now()));
    }

    fn start(&mut self, _handle: DriverHandle, mode: WifiMode, credentials: Option<&WifiCredentials>) {
        if mode == WifiMode::SoftAp {
            info!("Soft AP provisioning is not available on the host driver");
        }
        if let Some(credentials) = credentials {
            info!(ssid = %credentials.ssid, "Using network joined by the host");
        }
        self.pending
            .push_back(DriverEvent::ConnectionChanged(ConnectionState::Connected));
    }

    fn poll_events(&mut self) -> Vec<DriverEvent> {
        self.pending.drain(..).collect()
    }
}

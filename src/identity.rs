use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

use crate::error::IdentityError;
use crate::types::DeviceId;

/// Prefix for ids derived from the secure element serial number. Matches
/// the common name on the device certificate.
pub const SERIAL_PREFIX: &str = "sn";

/// Identity used when the secure element cannot be read.
pub const PLACEHOLDER_DEVICE_ID: &str = "BAAAAADD1DBAAADD1D";

/// Device id fixed at build time, if any.
pub const BUILD_DEVICE_ID: Option<&str> = option_env!("HUB_DEVICE_ID");

pub trait SecureElement {
    fn serial_number(&mut self) -> Result<String, IdentityError>;
}

/// Serial number read from a file, for hosts exposing the secure element
/// through the filesystem.
#[derive(Debug, Clone)]
pub struct FileSecureElement {
    path: Option<PathBuf>,
}

impl FileSecureElement {
    pub fn new(path: Option<PathBuf>) -> Self {
        FileSecureElement { path }
    }
}

impl SecureElement for FileSecureElement {
    fn serial_number(&mut self) -> Result<String, IdentityError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| IdentityError::Unavailable("no serial number source configured".to_string()))?;
        let serial = fs::read_to_string(path)?.trim().to_uppercase();
        if serial.is_empty() {
            return Err(IdentityError::EmptySerial);
        }
        Ok(serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Configured,
    SecureElement,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub device_id: DeviceId,
    pub source: IdentitySource,
}

/// Resolve the device identity once at boot.
///
/// A configured id wins. Otherwise the secure element serial is used with
/// [`SERIAL_PREFIX`]. A secure element failure is logged and the placeholder
/// id is used so the device still attempts to reach the network.
pub fn resolve_identity<E>(configured: Option<&str>, element: &mut E) -> Identity
where
    E: SecureElement + ?Sized,
{
    if let Some(id) = configured.filter(|id| !id.is_empty()) {
        return Identity {
            device_id: DeviceId::new(id),
            source: IdentitySource::Configured,
        };
    }

    match element.serial_number() {
        Ok(serial) => {
            let device_id = DeviceId::new(format!("{SERIAL_PREFIX}{serial}"));
            info!(device_id = %device_id, "Device id derived from secure element");
            Identity {
                device_id,
                source: IdentitySource::SecureElement,
            }
        }
        Err(e) => {
            error!(error = %e, "Device id generation failed");
            Identity {
                device_id: DeviceId::new(PLACEHOLDER_DEVICE_ID),
                source: IdentitySource::Placeholder,
            }
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EncodeError;

/// Device identity token, resolved once at boot and never changed afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Telemetry document: {"temperature": 22}
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureTelemetry {
    pub temperature: i32,
}

/// Body of a successful `getMaxMinReport` command response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MaxMinReport {
    pub max_temp: i32,
    pub min_temp: i32,
    pub avg_temp: i32,
    pub start_time: String,
    pub end_time: String,
}

/// Reported value confirming a desired property: `{value, ac, av, ad}`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AckedValue<'a> {
    pub value: i32,
    pub ac: i32,
    pub av: i32,
    pub ad: &'a str,
}

/// Desired property value together with the twin version it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesiredProperty {
    pub value: i32,
    pub version: i32,
}

/// Incrementing request id attached to twin topics. Rendered as decimal and
/// kept within eight digits.
#[derive(Debug, Default, Clone)]
pub struct RequestIds {
    next: u32,
}

impl RequestIds {
    const LIMIT: u32 = 100_000_000;

    pub fn next_id(&mut self) -> String {
        let id = self.next;
        self.next = (self.next + 1) % Self::LIMIT;
        id.to_string()
    }
}

/// Owned, bounded output buffer for one class of outbound message.
///
/// Every encode overwrites the previous document, so a built document has
/// to be published before the next one of the same class is built. The
/// returned slice borrows the buffer mutably, which makes that ordering a
/// compile-time property.
#[derive(Debug)]
pub struct MessageBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl MessageBuffer {
    pub const TELEMETRY: usize = 256;
    pub const REPORTED_PROPERTY: usize = 128;
    pub const COMMAND_RESPONSE: usize = 256;

    pub fn with_capacity(capacity: usize) -> Self {
        MessageBuffer {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recently built document.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encode<T>(&mut self, value: &T) -> Result<&[u8], EncodeError>
    where
        T: Serialize + ?Sized,
    {
        self.bytes.clear();
        serde_json::to_writer(&mut self.bytes, value)?;
        if self.bytes.len() > self.capacity {
            let len = self.bytes.len();
            self.bytes.clear();
            return Err(EncodeError::Overflow {
                len,
                capacity: self.capacity,
            });
        }
        Ok(&self.bytes)
    }

    /// Copy a fixed document into the buffer.
    pub fn fill(&mut self, raw: &[u8]) -> Result<&[u8], EncodeError> {
        if raw.len() > self.capacity {
            return Err(EncodeError::Overflow {
                len: raw.len(),
                capacity: self.capacity,
            });
        }
        self.bytes.clear();
        self.bytes.extend_from_slice(raw);
        Ok(&self.bytes)
    }
}

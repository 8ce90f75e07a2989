use thiserror::Error;

/// Device identity could not be resolved from hardware.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("secure element unavailable: {0}")]
    Unavailable(String),
    #[error("secure element returned an empty serial number")]
    EmptySerial,
    #[error("failed to read serial number: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document of {len} bytes exceeds {capacity} byte buffer")]
    Overflow { len: usize, capacity: usize },
}

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("malformed twin document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("twin member `{member}` is not a 32-bit integer")]
    InvalidValue { member: String },
    #[error("twin member `{member}` not found")]
    NotFound { member: String },
}

impl TwinError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TwinError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command payload is empty")]
    EmptyPayload,
    #[error("malformed command payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("`since` value of {len} bytes does not fit")]
    SinceTooLong { len: usize },
    #[error("unsupported command `{0}`")]
    Unsupported(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to read TLS material {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic `{0}` is not a recognised hub topic")]
    Unrecognised(String),
    #[error("topic `{topic}` is missing `{field}`")]
    MissingField { topic: String, field: &'static str },
    #[error("topic `{topic}` has invalid status `{status}`")]
    InvalidStatus { topic: String, status: String },
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("unexpected provisioning topic `{0}`")]
    UnexpectedTopic(String),
    #[error("malformed provisioning response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("provisioning response carries no operation id")]
    MissingOperationId,
    #[error("provisioning finished without an assigned hub")]
    MissingAssignedHub,
    #[error("provisioning rejected with status {status}: {reason}")]
    Rejected { status: u16, reason: String },
}

//! Device provisioning sub-protocol spoken over the transport session.
//!
//! Registration flow: publish a register request, receive `202` with an
//! operation id, poll the operation status after the advertised
//! `retry-after`, and finish on `200` with the assigned hub host.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{EncodeError, ProvisioningError};
use crate::topics::query_value;
use crate::types::{DeviceId, RequestIds};

pub const DPS_API_VERSION: &str = "2019-03-31";
pub const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";
pub const DPS_SUBSCRIPTION: &str = "$dps/registrations/res/#";

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum DpsStep {
    Pending,
    Assigned { hub_host: String },
    Failed(ProvisioningError),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest<'a> {
    registration_id: &'a str,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    operation_id: Option<String>,
    status: Option<String>,
    registration_state: Option<RegistrationState>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug)]
pub struct DpsRegistration {
    registration_id: String,
    request_ids: RequestIds,
    operation_id: Option<String>,
    next_query: Option<Instant>,
}

impl DpsRegistration {
    pub fn new(device_id: &DeviceId) -> Self {
        DpsRegistration {
            registration_id: device_id.as_str().to_string(),
            request_ids: RequestIds::default(),
            operation_id: None,
            next_query: None,
        }
    }

    pub fn username(id_scope: &str, device_id: &DeviceId) -> String {
        format!("{id_scope}/registrations/{device_id}/api-version={DPS_API_VERSION}")
    }

    pub fn register_request(&mut self) -> Result<OutboundRequest, EncodeError> {
        let payload = serde_json::to_vec(&RegistrationRequest {
            registration_id: &self.registration_id,
        })?;
        Ok(OutboundRequest {
            topic: format!(
                "$dps/registrations/PUT/iotdps-register/?$rid={}",
                self.request_ids.next_id()
            ),
            payload,
        })
    }

    /// Status query for a pending operation, once its retry-after has elapsed.
    pub fn due_request(&mut self, now: Instant) -> Result<Option<OutboundRequest>, EncodeError> {
        match (self.next_query, &self.operation_id) {
            (Some(at), Some(operation_id)) if at <= now => {
                let topic = format!(
                    "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
                    self.request_ids.next_id(),
                    operation_id
                );
                self.next_query = None;
                Ok(Some(OutboundRequest {
                    topic,
                    payload: Vec::new(),
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn on_response(&mut self, topic: &str, payload: &[u8], now: Instant) -> DpsStep {
        let Some(rest) = topic.strip_prefix(DPS_RESPONSE_PREFIX) else {
            return DpsStep::Failed(ProvisioningError::UnexpectedTopic(topic.to_string()));
        };
        let (status, query) = rest.split_once("/?").unwrap_or((rest.trim_end_matches('/'), ""));
        let Ok(status) = status.parse::<u16>() else {
            return DpsStep::Failed(ProvisioningError::UnexpectedTopic(topic.to_string()));
        };

        let response: RegistrationResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => return DpsStep::Failed(ProvisioningError::Parse(e)),
        };

        match status {
            202 => {
                let Some(operation_id) = response.operation_id else {
                    return DpsStep::Failed(ProvisioningError::MissingOperationId);
                };
                let retry_after = query_value(query, "retry-after")
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RETRY_AFTER);
                self.operation_id = Some(operation_id);
                self.next_query = Some(now + retry_after);
                DpsStep::Pending
            }
            200 => {
                self.next_query = None;
                match response.registration_state.and_then(|state| state.assigned_hub) {
                    Some(hub_host) => DpsStep::Assigned { hub_host },
                    None => DpsStep::Failed(ProvisioningError::MissingAssignedHub),
                }
            }
            _ => {
                self.next_query = None;
                let reason = response
                    .registration_state
                    .and_then(|state| state.error_message)
                    .or(response.status)
                    .unwrap_or_default();
                DpsStep::Failed(ProvisioningError::Rejected { status, reason })
            }
        }
    }
}

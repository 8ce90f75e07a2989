use crate::error::TopicError;
use crate::types::DeviceId;

pub const METHODS_REQUEST_PREFIX: &str = "$iothub/methods/POST/";
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub const DESIRED_PATCH_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Subscriptions a hub session needs before it can receive commands and twin traffic.
pub const HUB_SUBSCRIPTIONS: [&str; 3] = [
    "$iothub/methods/POST/#",
    "$iothub/twin/res/#",
    "$iothub/twin/PATCH/properties/desired/#",
];

pub fn telemetry_topic(device_id: &DeviceId) -> String {
    format!("devices/{device_id}/messages/events/")
}

pub fn method_response_topic(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

pub fn twin_get_topic(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

pub fn reported_patch_topic(request_id: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

/// Kind of twin message carried on a twin topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinMessageKind {
    GetResponse,
    DesiredPatch,
    ReportedAck,
    RequestFailed,
}

/// An inbound hub topic with its embedded fields extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubTopic {
    MethodRequest {
        name: String,
        request_id: String,
    },
    Twin {
        kind: TwinMessageKind,
        request_id: Option<String>,
        status: Option<u16>,
        version: Option<i64>,
    },
}

/// Classify an inbound topic.
///
/// Twin responses share one topic family; status 200 answers a GET, 204
/// acknowledges a reported patch, anything else is a failed request.
pub fn parse_hub_topic(topic: &str) -> Result<HubTopic, TopicError> {
    if let Some(rest) = topic.strip_prefix(METHODS_REQUEST_PREFIX) {
        let (name, query) = split_query(rest);
        let name = name.trim_end_matches('/');
        if name.is_empty() {
            return Err(missing(topic, "method name"));
        }
        let request_id = query_value(query, "$rid").ok_or_else(|| missing(topic, "$rid"))?;
        return Ok(HubTopic::MethodRequest {
            name: name.to_string(),
            request_id: request_id.to_string(),
        });
    }

    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let (status, query) = split_query(rest);
        let status = status.trim_end_matches('/');
        let code: u16 = status.parse().map_err(|_| TopicError::InvalidStatus {
            topic: topic.to_string(),
            status: status.to_string(),
        })?;
        let kind = match code {
            200 => TwinMessageKind::GetResponse,
            204 => TwinMessageKind::ReportedAck,
            _ => TwinMessageKind::RequestFailed,
        };
        return Ok(HubTopic::Twin {
            kind,
            request_id: query_value(query, "$rid").map(str::to_string),
            status: Some(code),
            version: query_value(query, "$version").and_then(|v| v.parse().ok()),
        });
    }

    if let Some(rest) = topic.strip_prefix(DESIRED_PATCH_PREFIX) {
        let (_, query) = split_query(rest);
        return Ok(HubTopic::Twin {
            kind: TwinMessageKind::DesiredPatch,
            request_id: None,
            status: None,
            version: query_value(query, "$version").and_then(|v| v.parse().ok()),
        });
    }

    Err(TopicError::Unrecognised(topic.to_string()))
}

fn split_query(rest: &str) -> (&str, &str) {
    match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    }
}

pub(crate) fn query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn missing(topic: &str, field: &'static str) -> TopicError {
    TopicError::MissingField {
        topic: topic.to_string(),
        field,
    }
}

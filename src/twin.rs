//! Device twin synchronisation: desired-property parsing, acknowledgement
//! patches and one-way reported properties.

use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, Visitor};
use serde::{Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::error::{EncodeError, TransportError, TwinError};
use crate::telemetry::TelemetryAggregator;
use crate::topics::{reported_patch_topic, TwinMessageKind};
use crate::transport::{CloudTransport, QoS};
use crate::types::{AckedValue, DesiredProperty, MessageBuffer, RequestIds};

pub const DESIRED_MEMBER: &str = "desired";
pub const VERSION_MEMBER: &str = "$version";
pub const TARGET_TEMPERATURE: &str = "targetTemperature";
pub const MAX_TEMP_SINCE_REBOOT: &str = "maxTempSinceLastReboot";

pub const ACK_SUCCESS: i32 = 200;
pub const ACK_SUCCESS_DESCRIPTION: &str = "success";

/// Extract a desired property and the twin `$version` from a document.
///
/// With `is_full_twin_snapshot` the document is a full twin and the search
/// happens inside its `desired` member; otherwise the document is a desired
/// patch and is searched directly. Members other than the property and the
/// version are skipped whatever their shape. Both must be present for a
/// match; a present member that is not a 32-bit integer is a parse error.
pub fn parse_desired_property(
    document: &[u8],
    name: &str,
    is_full_twin_snapshot: bool,
) -> Result<DesiredProperty, TwinError> {
    let mut de = serde_json::Deserializer::from_slice(document);
    let found = if is_full_twin_snapshot {
        SnapshotMembers { name }
            .deserialize(&mut de)?
            .ok_or_else(|| TwinError::NotFound {
                member: DESIRED_MEMBER.to_string(),
            })?
    } else {
        DesiredMembers { name }.deserialize(&mut de)?
    };
    de.end()?;

    let (value, version) = match (found.value, found.version) {
        (Some(value), Some(version)) => (value, version),
        (None, _) => {
            return Err(TwinError::NotFound {
                member: name.to_string(),
            })
        }
        (_, None) => {
            return Err(TwinError::NotFound {
                member: VERSION_MEMBER.to_string(),
            })
        }
    };

    Ok(DesiredProperty {
        value: as_i32(name, &value)?,
        version: as_i32(VERSION_MEMBER, &version)?,
    })
}

/// `{ name: { "value": v, "ac": code, "av": version, "ad": description } }`
pub fn build_ack<'b>(
    buffer: &'b mut MessageBuffer,
    property_name: &str,
    value: i32,
    ack_code: i32,
    version: i32,
    description: &str,
) -> Result<&'b [u8], EncodeError> {
    buffer.encode(&SingleProperty {
        name: property_name,
        value: AckedValue {
            value,
            ac: ack_code,
            av: version,
            ad: description,
        },
    })
}

/// `{ name: value }`
pub fn build_simple_report<'b>(
    buffer: &'b mut MessageBuffer,
    property_name: &str,
    value: i32,
) -> Result<&'b [u8], EncodeError> {
    buffer.encode(&SingleProperty {
        name: property_name,
        value,
    })
}

/// Twin protocol state: owns the reported-property buffer and remembers the
/// last desired target the device accepted.
#[derive(Debug)]
pub struct TwinSync {
    buffer: MessageBuffer,
    accepted: Option<DesiredProperty>,
}

impl Default for TwinSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TwinSync {
    pub fn new() -> Self {
        TwinSync {
            buffer: MessageBuffer::with_capacity(MessageBuffer::REPORTED_PROPERTY),
            accepted: None,
        }
    }

    pub fn accepted(&self) -> Option<DesiredProperty> {
        self.accepted
    }

    /// React to one inbound twin message. Returns the desired property that
    /// was acknowledged, if any.
    pub fn handle_message<T>(
        &mut self,
        kind: TwinMessageKind,
        payload: &[u8],
        request_ids: &mut RequestIds,
        transport: &mut T,
    ) -> Option<DesiredProperty>
    where
        T: CloudTransport + ?Sized,
    {
        let desired = match kind {
            TwinMessageKind::GetResponse => {
                info!("Twin GET response received");
                match parse_desired_property(payload, TARGET_TEMPERATURE, true) {
                    Ok(desired) => desired,
                    Err(e) if e.is_not_found() => {
                        debug!(reason = %e, "No desired temperature in twin");
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Discarding twin document");
                        return None;
                    }
                }
            }
            TwinMessageKind::DesiredPatch => {
                info!("Twin desired properties received");
                match parse_desired_property(payload, TARGET_TEMPERATURE, false) {
                    Ok(desired) => desired,
                    Err(e) => {
                        error!(error = %e, "Could not parse desired temperature property");
                        return None;
                    }
                }
            }
            TwinMessageKind::ReportedAck => {
                info!("Twin reported properties response received");
                return None;
            }
            TwinMessageKind::RequestFailed => {
                warn!("Twin request rejected by the service");
                return None;
            }
        };

        info!(
            value = desired.value,
            version = desired.version,
            "Desired temperature accepted"
        );
        self.accepted = Some(desired);

        let doc = match build_ack(
            &mut self.buffer,
            TARGET_TEMPERATURE,
            desired.value,
            ACK_SUCCESS,
            desired.version,
            ACK_SUCCESS_DESCRIPTION,
        ) {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "Could not build reported property");
                return None;
            }
        };
        if let Err(e) = publish_reported(doc, request_ids, transport) {
            error!(error = %e, "Failed to publish desired property acknowledgement");
        }
        Some(desired)
    }

    /// Publish `maxTempSinceLastReboot` when the aggregate reports a new
    /// maximum. The flag is cleared only when the publish succeeds.
    pub fn report_max_if_changed<T>(
        &mut self,
        telemetry: &mut TelemetryAggregator,
        request_ids: &mut RequestIds,
        transport: &mut T,
    ) -> bool
    where
        T: CloudTransport + ?Sized,
    {
        if !telemetry.max_changed() {
            return false;
        }

        let doc = match build_simple_report(&mut self.buffer, MAX_TEMP_SINCE_REBOOT, telemetry.max()) {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "Could not build reported property");
                return false;
            }
        };
        match publish_reported(doc, request_ids, transport) {
            Ok(()) => {
                debug!(max = telemetry.max(), "Reported new maximum temperature");
                telemetry.clear_max_changed();
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to report maximum temperature");
                false
            }
        }
    }
}

fn publish_reported<T>(
    doc: &[u8],
    request_ids: &mut RequestIds,
    transport: &mut T,
) -> Result<(), TransportError>
where
    T: CloudTransport + ?Sized,
{
    let topic = reported_patch_topic(&request_ids.next_id());
    debug!(topic = %topic, "Sending twin reported property");
    transport.publish(&topic, doc, QoS::AtMostOnce)
}

fn as_i32(member: &str, value: &Value) -> Result<i32, TwinError> {
    value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| TwinError::InvalidValue {
            member: member.to_string(),
        })
}

struct SingleProperty<'a, T> {
    name: &'a str,
    value: T,
}

impl<T: Serialize> Serialize for SingleProperty<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.name, &self.value)?;
        map.end()
    }
}

#[derive(Default)]
struct Found {
    value: Option<Value>,
    version: Option<Value>,
}

// Scans the members of a desired-properties object.
struct DesiredMembers<'n> {
    name: &'n str,
}

impl<'de> DeserializeSeed<'de> for DesiredMembers<'_> {
    type Value = Found;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Found, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for DesiredMembers<'_> {
    type Value = Found;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a desired properties object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Found, A::Error> {
        let mut found = Found::default();
        while let Some(key) = map.next_key::<String>()? {
            if key == self.name {
                found.value = Some(map.next_value()?);
            } else if key == VERSION_MEMBER {
                found.version = Some(map.next_value()?);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }
}

// Scans a full twin for its `desired` member.
struct SnapshotMembers<'n> {
    name: &'n str,
}

impl<'de> DeserializeSeed<'de> for SnapshotMembers<'_> {
    type Value = Option<Found>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Option<Found>, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for SnapshotMembers<'_> {
    type Value = Option<Found>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a twin document")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Option<Found>, A::Error> {
        let mut desired = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == DESIRED_MEMBER {
                desired = Some(map.next_value_seed(DesiredMembers { name: self.name })?);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(desired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;
    use crate::transport::{Endpoint, TransportEvent};

    #[derive(Default)]
    struct RecordingTransport {
        fail: bool,
        published: Vec<(String, Vec<u8>)>,
    }

    impl CloudTransport for RecordingTransport {
        fn connect(&mut self, _: &Endpoint, _: &DeviceId) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn publish(&mut self, topic: &str, payload: &[u8], _: QoS) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            self.published.push((topic.to_string(), payload.to_vec()));
            Ok(())
        }
        fn poll(&mut self) -> Vec<TransportEvent> {
            Vec::new()
        }
    }

    #[test]
    fn test_parse_full_twin_snapshot() {
        let doc = br#"{"desired":{"targetTemperature":21,"$version":3}}"#;
        let parsed = parse_desired_property(doc, TARGET_TEMPERATURE, true).unwrap();
        assert_eq!(parsed, DesiredProperty { value: 21, version: 3 });
    }

    #[test]
    fn test_parse_desired_patch() {
        let doc = br#"{"targetTemperature":19,"$version":4}"#;
        let parsed = parse_desired_property(doc, TARGET_TEMPERATURE, false).unwrap();
        assert_eq!(parsed, DesiredProperty { value: 19, version: 4 });
    }

    #[test]
    fn test_parse_skips_unrelated_members_of_any_shape() {
        let doc = br#"{
            "reported":{"maxTempSinceLastReboot":30,"nested":{"a":[1,2,{"b":null}]}},
            "desired":{"other":[{"x":"y"}],"$version":9,"flag":true,"targetTemperature":-5}
        }"#;
        let parsed = parse_desired_property(doc, TARGET_TEMPERATURE, true).unwrap();
        assert_eq!(parsed, DesiredProperty { value: -5, version: 9 });
    }

    #[test]
    fn test_parse_ack_document_is_not_a_desired_document() {
        let mut buffer = MessageBuffer::with_capacity(MessageBuffer::REPORTED_PROPERTY);
        let ack = build_ack(&mut buffer, TARGET_TEMPERATURE, 21, 200, 3, "success").unwrap();
        let err = parse_desired_property(ack, TARGET_TEMPERATURE, false).unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[test]
    fn test_parse_snapshot_without_desired() {
        let doc = br#"{"reported":{"targetTemperature":21,"$version":3}}"#;
        let err = parse_desired_property(doc, TARGET_TEMPERATURE, true).unwrap_err();
        assert!(matches!(err, TwinError::NotFound { ref member } if member == DESIRED_MEMBER));
    }

    #[test]
    fn test_parse_snapshot_with_unset_property() {
        let doc = br#"{"desired":{"$version":1},"reported":{}}"#;
        let err = parse_desired_property(doc, TARGET_TEMPERATURE, true).unwrap_err();
        assert!(matches!(err, TwinError::NotFound { ref member } if member == TARGET_TEMPERATURE));
    }

    #[test]
    fn test_parse_patch_without_version() {
        let doc = br#"{"targetTemperature":19}"#;
        let err = parse_desired_property(doc, TARGET_TEMPERATURE, false).unwrap_err();
        assert!(matches!(err, TwinError::NotFound { ref member } if member == VERSION_MEMBER));
    }

    #[test]
    fn test_parse_patch_does_not_unwrap_desired() {
        let doc = br#"{"desired":{"targetTemperature":21,"$version":3}}"#;
        let err = parse_desired_property(doc, TARGET_TEMPERATURE, false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_malformed_json() {
        let err = parse_desired_property(br#"{"targetTemperature":"#, TARGET_TEMPERATURE, false)
            .unwrap_err();
        assert!(matches!(err, TwinError::Parse(_)));

        let err = parse_desired_property(b"[1,2]", TARGET_TEMPERATURE, false).unwrap_err();
        assert!(matches!(err, TwinError::Parse(_)));

        let err = parse_desired_property(br#"{"desired":5}"#, TARGET_TEMPERATURE, true)
            .unwrap_err();
        assert!(matches!(err, TwinError::Parse(_)));
    }

    #[test]
    fn test_parse_non_integer_value() {
        let doc = br#"{"targetTemperature":21.5,"$version":4}"#;
        let err = parse_desired_property(doc, TARGET_TEMPERATURE, false).unwrap_err();
        assert!(matches!(err, TwinError::InvalidValue { .. }));

        let doc = br#"{"targetTemperature":21,"$version":4294967296}"#;
        let err = parse_desired_property(doc, TARGET_TEMPERATURE, false).unwrap_err();
        assert!(matches!(err, TwinError::InvalidValue { .. }));
    }

    #[test]
    fn test_build_ack_shape() {
        let mut buffer = MessageBuffer::with_capacity(MessageBuffer::REPORTED_PROPERTY);
        let doc = build_ack(&mut buffer, TARGET_TEMPERATURE, 21, 200, 3, "success").unwrap();
        assert_eq!(
            std::str::from_utf8(doc).unwrap(),
            r#"{"targetTemperature":{"value":21,"ac":200,"av":3,"ad":"success"}}"#
        );
    }

    #[test]
    fn test_build_simple_report_shape() {
        let mut buffer = MessageBuffer::with_capacity(MessageBuffer::REPORTED_PROPERTY);
        let doc = build_simple_report(&mut buffer, MAX_TEMP_SINCE_REBOOT, 31).unwrap();
        assert_eq!(doc, br#"{"maxTempSinceLastReboot":31}"#);
    }

    #[test]
    fn test_desired_push_publishes_exactly_one_ack() {
        let mut twin = TwinSync::new();
        let mut ids = RequestIds::default();
        let mut transport = RecordingTransport::default();

        let acked = twin.handle_message(
            TwinMessageKind::DesiredPatch,
            br#"{"targetTemperature":19,"$version":4}"#,
            &mut ids,
            &mut transport,
        );

        assert_eq!(acked, Some(DesiredProperty { value: 19, version: 4 }));
        assert_eq!(transport.published.len(), 1);
        let (topic, payload) = &transport.published[0];
        assert_eq!(topic, "$iothub/twin/PATCH/properties/reported/?$rid=0");
        let doc: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(doc["targetTemperature"]["av"], 4);
        assert_eq!(doc["targetTemperature"]["value"], 19);
        assert_eq!(doc["targetTemperature"]["ac"], 200);
        assert_eq!(twin.accepted(), acked);
    }

    #[test]
    fn test_get_response_without_desired_takes_no_action() {
        let mut twin = TwinSync::new();
        let mut ids = RequestIds::default();
        let mut transport = RecordingTransport::default();

        let acked = twin.handle_message(
            TwinMessageKind::GetResponse,
            br#"{"desired":{"$version":1},"reported":{"$version":1}}"#,
            &mut ids,
            &mut transport,
        );

        assert!(acked.is_none());
        assert!(transport.published.is_empty());
    }

    #[test]
    fn test_get_response_with_desired_is_acknowledged() {
        let mut twin = TwinSync::new();
        let mut ids = RequestIds::default();
        let mut transport = RecordingTransport::default();

        let acked = twin.handle_message(
            TwinMessageKind::GetResponse,
            br#"{"desired":{"targetTemperature":21,"$version":3},"reported":{}}"#,
            &mut ids,
            &mut transport,
        );

        assert_eq!(acked, Some(DesiredProperty { value: 21, version: 3 }));
        assert_eq!(transport.published.len(), 1);
    }

    #[test]
    fn test_malformed_desired_push_is_discarded() {
        let mut twin = TwinSync::new();
        let mut ids = RequestIds::default();
        let mut transport = RecordingTransport::default();

        let acked = twin.handle_message(
            TwinMessageKind::DesiredPatch,
            b"{not json",
            &mut ids,
            &mut transport,
        );
        assert!(acked.is_none());
        assert!(transport.published.is_empty());
    }

    #[test]
    fn test_reported_ack_is_informational() {
        let mut twin = TwinSync::new();
        let mut ids = RequestIds::default();
        let mut transport = RecordingTransport::default();

        assert!(twin
            .handle_message(TwinMessageKind::ReportedAck, b"", &mut ids, &mut transport)
            .is_none());
        assert!(transport.published.is_empty());
    }

    #[test]
    fn test_max_report_clears_flag_only_on_success() {
        let mut twin = TwinSync::new();
        let mut ids = RequestIds::default();
        let mut telemetry = TelemetryAggregator::new();
        telemetry.record(27);

        let mut failing = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        assert!(!twin.report_max_if_changed(&mut telemetry, &mut ids, &mut failing));
        assert!(telemetry.max_changed());

        let mut transport = RecordingTransport::default();
        assert!(twin.report_max_if_changed(&mut telemetry, &mut ids, &mut transport));
        assert!(!telemetry.max_changed());
        assert_eq!(transport.published[0].1, br#"{"maxTempSinceLastReboot":27}"#.to_vec());

        // nothing pending, nothing sent
        assert!(!twin.report_max_if_changed(&mut telemetry, &mut ids, &mut transport));
        assert_eq!(transport.published.len(), 1);
    }
}

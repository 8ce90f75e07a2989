use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use tracing::{error, info, warn};

use crate::error::CommandError;
use crate::telemetry::TelemetryAggregator;
use crate::topics::method_response_topic;
use crate::transport::{CloudTransport, QoS};
use crate::types::{MaxMinReport, MessageBuffer};

pub const MAX_MIN_REPORT: &str = "getMaxMinReport";

/// Error body sent with 400 and 404 responses.
pub const ERROR_PAYLOAD: &[u8] = b"{}";

/// `since` values are read into a 32 byte field buffer.
pub const SINCE_CAPACITY: usize = 32;

// ISO-8601 with fixed milliseconds and numeric offset, e.g. 2024-01-01T10:00:00.000+0000Z
pub const END_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000%zZ";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;

/// Command invocation as classified from its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub request_id: String,
    pub name: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct CommandResponse<'a> {
    pub status: u16,
    pub payload: &'a [u8],
}

/// Routes command invocations and builds their responses in an owned buffer.
#[derive(Debug)]
pub struct CommandDispatcher {
    buffer: MessageBuffer,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        CommandDispatcher {
            buffer: MessageBuffer::with_capacity(MessageBuffer::COMMAND_RESPONSE),
        }
    }

    pub fn dispatch<Tz>(
        &mut self,
        name: &str,
        payload: &[u8],
        telemetry: &TelemetryAggregator,
        now: &DateTime<Tz>,
    ) -> CommandResponse<'_>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let status = match self.invoke(name, payload, telemetry, now) {
            Ok(()) => STATUS_OK,
            Err(e) => {
                let status = match e {
                    CommandError::Unsupported(_) => STATUS_NOT_FOUND,
                    _ => STATUS_BAD_REQUEST,
                };
                warn!(command = %name, status, error = %e, "Command failed");
                if let Err(e) = self.buffer.fill(ERROR_PAYLOAD) {
                    error!(error = %e, "Could not build error payload");
                }
                status
            }
        };

        CommandResponse {
            status,
            payload: self.buffer.as_bytes(),
        }
    }

    /// Dispatch a request and publish its response on the response topic
    /// for its request id. Publish failures are logged, not retried.
    pub fn respond<T, Tz>(
        &mut self,
        request: &CommandRequest,
        payload: &[u8],
        telemetry: &TelemetryAggregator,
        now: &DateTime<Tz>,
        transport: &mut T,
    ) -> u16
    where
        T: CloudTransport + ?Sized,
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let response = self.dispatch(&request.name, payload, telemetry, now);
        let topic = method_response_topic(response.status, &request.request_id);

        info!(status = response.status, request_id = %request.request_id, "Command status");
        match transport.publish(&topic, response.payload, QoS::AtMostOnce) {
            Ok(()) => info!("Sent command response"),
            Err(e) => error!(status = response.status, error = %e, "Unable to send command response"),
        }
        response.status
    }

    fn invoke<Tz>(
        &mut self,
        name: &str,
        payload: &[u8],
        telemetry: &TelemetryAggregator,
        now: &DateTime<Tz>,
    ) -> Result<(), CommandError>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        if name != MAX_MIN_REPORT {
            return Err(CommandError::Unsupported(name.to_string()));
        }

        let report = MaxMinReport {
            max_temp: telemetry.max(),
            min_temp: telemetry.min(),
            avg_temp: telemetry.average(),
            start_time: parse_since(payload)?,
            end_time: now.format(END_TIME_FORMAT).to_string(),
        };
        self.buffer.encode(&report)?;
        Ok(())
    }
}

/// Read the `since` timestamp. The payload's first JSON value must be a
/// bare string; an object wrapping it is rejected.
pub fn parse_since(payload: &[u8]) -> Result<String, CommandError> {
    if payload.is_empty() {
        return Err(CommandError::EmptyPayload);
    }
    let since = serde_json::Deserializer::from_slice(payload)
        .into_iter::<String>()
        .next()
        .ok_or(CommandError::EmptyPayload)??;
    if since.len() >= SINCE_CAPACITY {
        return Err(CommandError::SinceTooLong { len: since.len() });
    }
    Ok(since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};
    use serde_json::Value;

    fn telemetry() -> TelemetryAggregator {
        let mut agg = TelemetryAggregator::new();
        for sample in [20, 25, 18] {
            agg.record(sample);
        }
        agg
    }

    #[test]
    fn test_report_command_succeeds() {
        let mut dispatcher = CommandDispatcher::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let response = dispatcher.dispatch(
            MAX_MIN_REPORT,
            br#""2024-01-01T00:00:00Z""#,
            &telemetry(),
            &now,
        );

        assert_eq!(response.status, STATUS_OK);
        let report: MaxMinReport = serde_json::from_slice(response.payload).unwrap();
        assert_eq!(report.max_temp, 25);
        assert_eq!(report.min_temp, 18);
        assert_eq!(report.avg_temp, 21);
        assert_eq!(report.start_time, "2024-01-01T00:00:00Z");
        assert_eq!(report.end_time, "2024-01-02T03:04:05.000+0000Z");
    }

    #[test]
    fn test_end_time_is_well_formed_with_offset() {
        let mut dispatcher = CommandDispatcher::new();
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let now = offset.with_ymd_and_hms(2024, 6, 30, 23, 59, 1).unwrap();
        let response = dispatcher.dispatch(MAX_MIN_REPORT, br#""x""#, &telemetry(), &now);

        let doc: Value = serde_json::from_slice(response.payload).unwrap();
        let end_time = doc["endTime"].as_str().unwrap();
        assert_eq!(end_time, "2024-06-30T23:59:01.000-0500Z");

        let parsed = DateTime::parse_from_str(
            end_time.trim_end_matches('Z'),
            "%Y-%m-%dT%H:%M:%S%.3f%z",
        )
        .unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_empty_payload_is_bad_request() {
        let mut dispatcher = CommandDispatcher::new();
        let response = dispatcher.dispatch(MAX_MIN_REPORT, b"", &telemetry(), &Utc::now());

        assert_eq!(response.status, STATUS_BAD_REQUEST);
        assert_eq!(response.payload, ERROR_PAYLOAD);
        let doc: Value = serde_json::from_slice(response.payload).unwrap();
        assert!(doc.get("maxTemp").is_none());
    }

    #[test]
    fn test_object_payload_is_rejected() {
        // the command expects a bare string, not {"since": ...}
        let mut dispatcher = CommandDispatcher::new();
        let response = dispatcher.dispatch(
            MAX_MIN_REPORT,
            br#"{"since":"2024-01-01T00:00:00Z"}"#,
            &telemetry(),
            &Utc::now(),
        );
        assert_eq!(response.status, STATUS_BAD_REQUEST);
        assert_eq!(response.payload, ERROR_PAYLOAD);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let mut dispatcher = CommandDispatcher::new();
        let response = dispatcher.dispatch(MAX_MIN_REPORT, b"\"unterminated", &telemetry(), &Utc::now());
        assert_eq!(response.status, STATUS_BAD_REQUEST);
    }

    #[test]
    fn test_since_must_fit_field_buffer() {
        let long = format!("\"{}\"", "9".repeat(SINCE_CAPACITY));
        assert!(matches!(
            parse_since(long.as_bytes()),
            Err(CommandError::SinceTooLong { len: 32 })
        ));
        let fits = format!("\"{}\"", "9".repeat(SINCE_CAPACITY - 1));
        assert!(parse_since(fits.as_bytes()).is_ok());
    }

    #[test]
    fn test_only_first_token_is_read() {
        assert_eq!(parse_since(br#""a" "b""#).unwrap(), "a");
    }

    #[test]
    fn test_unknown_command_is_not_found() {
        let mut dispatcher = CommandDispatcher::new();
        let response = dispatcher.dispatch("foo", br#""2024-01-01T00:00:00Z""#, &telemetry(), &Utc::now());
        assert_eq!(response.status, STATUS_NOT_FOUND);
        assert_eq!(response.payload, b"{}");
    }

    #[test]
    fn test_error_after_success_overwrites_buffer() {
        let mut dispatcher = CommandDispatcher::new();
        let ok = dispatcher.dispatch(MAX_MIN_REPORT, br#""s""#, &telemetry(), &Utc::now());
        assert_eq!(ok.status, STATUS_OK);

        let failed = dispatcher.dispatch(MAX_MIN_REPORT, b"", &telemetry(), &Utc::now());
        assert_eq!(failed.payload, ERROR_PAYLOAD);
    }
}

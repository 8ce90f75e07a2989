//! Device core: the owned [`DeviceContext`] and the per-iteration task
//! function that runs bring-up and, once active, the periodic work.

use chrono::{DateTime, Local, Utc};
use std::net::IpAddr;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bringup::{Bringup, BringupState, Step};
use crate::cloud::CloudSession;
use crate::command::{CommandDispatcher, CommandRequest};
use crate::config::Config;
use crate::device::{Led, StatusIndicator, TemperatureSensor};
use crate::driver::{ConnectionState, DriverEvent, DriverHandle, NetworkDriver, WifiCredentials, WifiMode};
use crate::identity::{resolve_identity, Identity, SecureElement};
use crate::scheduler::{PeriodicTask, Scheduler};
use crate::telemetry::TelemetryAggregator;
use crate::topics::{parse_hub_topic, telemetry_topic, HubTopic, TwinMessageKind};
use crate::transport::{CloudTransport, Endpoint, InboundMessage, QoS, TransportEvent};
use crate::twin::TwinSync;
use crate::types::{DesiredProperty, MessageBuffer, RequestIds, TemperatureTelemetry};

/// Value the radio reports for "time not set yet".
pub const UNSET_TIME_UTC: i64 = 0x8661_5400;

/// External collaborators the core drives.
pub struct Peripherals {
    pub driver: Box<dyn NetworkDriver>,
    pub transport: Box<dyn CloudTransport>,
    pub secure_element: Box<dyn SecureElement>,
    pub sensor: Box<dyn TemperatureSensor>,
    pub indicator: Box<dyn StatusIndicator>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    pub ap_connected: bool,
    pub address: Option<IpAddr>,
    pub error: bool,
    pub last_time_sync: Option<DateTime<Utc>>,
}

/// All mutable device state, owned in one place.
#[derive(Debug)]
pub struct DeviceContext {
    pub identity: Option<Identity>,
    pub telemetry: TelemetryAggregator,
    pub network: NetworkStatus,
    pub request_ids: RequestIds,
    last_send: Option<Instant>,
    telemetry_buffer: MessageBuffer,
}

impl Default for DeviceContext {
    fn default() -> Self {
        DeviceContext {
            identity: None,
            telemetry: TelemetryAggregator::new(),
            network: NetworkStatus::default(),
            request_ids: RequestIds::default(),
            last_send: None,
            telemetry_buffer: MessageBuffer::with_capacity(MessageBuffer::TELEMETRY),
        }
    }
}

pub struct App {
    config: Config,
    peripherals: Peripherals,
    context: DeviceContext,
    bringup: Bringup,
    scheduler: Scheduler,
    cloud: CloudSession,
    twin: TwinSync,
    commands: CommandDispatcher,
}

impl App {
    pub fn new(config: Config, peripherals: Peripherals) -> Self {
        let bringup = Bringup::new(config.driver_wait_limit);
        App {
            config,
            peripherals,
            context: DeviceContext::default(),
            bringup,
            scheduler: Scheduler::new(),
            cloud: CloudSession::new(),
            twin: TwinSync::new(),
            commands: CommandDispatcher::new(),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bringup_state(&self) -> BringupState {
        self.bringup.state()
    }

    pub fn is_armed(&self, task: PeriodicTask) -> bool {
        self.scheduler.is_armed(task)
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.cloud.endpoint()
    }

    pub fn is_cloud_connected(&self) -> bool {
        self.cloud.is_connected()
    }

    /// Last desired temperature acknowledged to the twin.
    pub fn target_temperature(&self) -> Option<DesiredProperty> {
        self.twin.accepted()
    }

    /// One iteration of the main loop. Must run inside a tokio runtime; the
    /// periodic timers are tokio tasks.
    pub fn tasks(&mut self) {
        match self.bringup.step(self.peripherals.driver.as_mut()) {
            Step::ResolveIdentity => {
                let identity = resolve_identity(
                    self.config.device_id.as_deref(),
                    self.peripherals.secure_element.as_mut(),
                );
                info!(device_id = %identity.device_id, source = ?identity.source, "Device identity resolved");
                self.context.identity = Some(identity);
            }
            Step::Activate(handle) => self.activate(handle),
            Step::Run => self.run(),
            Step::Waiting | Step::Halted => {}
        }
    }

    fn activate(&mut self, handle: DriverHandle) {
        let driver = self.peripherals.driver.as_mut();
        driver.enable_time_sync(handle, &self.config.ntp_hostname);
        driver.start(handle, self.config.wifi_mode, self.config.wifi.as_ref());

        self.arm_timers();
        let endpoint = self.config.initial_endpoint();
        self.cloud.retarget(endpoint, self.peripherals.transport.as_mut());
    }

    fn arm_timers(&mut self) {
        self.scheduler
            .register_periodic(PeriodicTask::Cloud, self.config.cloud_interval());
        self.scheduler
            .register_periodic(PeriodicTask::Data, self.config.data_interval());
    }

    fn run(&mut self) {
        for task in self.scheduler.drain_due() {
            match task {
                PeriodicTask::Cloud => self.cloud_task(),
                PeriodicTask::Data => self.data_task(),
            }
        }

        for event in self.peripherals.driver.poll_events() {
            self.on_driver_event(event);
        }
        for event in self.peripherals.transport.poll() {
            self.on_transport_event(event);
        }
        self.peripherals.indicator.sched();
    }

    fn cloud_task(&mut self) {
        let Some(identity) = &self.context.identity else {
            return;
        };
        let result = self.cloud.tick(
            self.peripherals.transport.as_mut(),
            &identity.device_id,
            self.context.network.ap_connected,
            &mut self.context.request_ids,
        );
        if let Err(e) = &result {
            error!(error = %e, "Cloud connect failed");
        }
        self.context.network.error = result.is_err();
    }

    fn data_task(&mut self) {
        if self.cloud.is_connected() && self.send_due() {
            self.context.last_send = Some(Instant::now());
            self.send_to_cloud();
        }
        self.update_indicators();
    }

    /// Half a data tick of pickup jitter is tolerated, so a late pickup does
    /// not push the following send back by a whole period.
    fn send_due(&self) -> bool {
        let threshold = self
            .config
            .send_interval()
            .saturating_sub(self.config.data_interval() / 2);
        self.context
            .last_send
            .map_or(true, |last| last.elapsed() >= threshold)
    }

    fn send_to_cloud(&mut self) {
        let Some(identity) = &self.context.identity else {
            return;
        };
        let topic = telemetry_topic(&identity.device_id);

        // whole degrees
        let sample = self.peripherals.sensor.read_celsius() as i32;
        self.context.telemetry.record(sample);

        let reading = TemperatureTelemetry {
            temperature: self.context.telemetry.current(),
        };
        match self.context.telemetry_buffer.encode(&reading) {
            Ok(doc) => {
                if let Err(e) = self.peripherals.transport.publish(&topic, doc, QoS::AtMostOnce) {
                    error!(error = %e, "Connection lost, telemetry publish failed");
                } else {
                    debug!(temperature = reading.temperature, "Telemetry sent");
                }
            }
            Err(e) => error!(error = %e, "Could not build telemetry message"),
        }

        self.twin.report_max_if_changed(
            &mut self.context.telemetry,
            &mut self.context.request_ids,
            self.peripherals.transport.as_mut(),
        );
    }

    fn update_indicators(&mut self) {
        let indicator = self.peripherals.indicator.as_mut();
        indicator.set(Led::Wifi, self.context.network.ap_connected);
        indicator.set(Led::Error, self.context.network.error);
        if !indicator.is_blinking(Led::Cloud) {
            indicator.set(Led::Cloud, self.cloud.is_connected());
        }
    }

    fn on_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::ConnectionChanged(ConnectionState::Connected) => {
                info!("Wi-Fi connected");
                self.context.network.ap_connected = true;
            }
            DriverEvent::ConnectionChanged(ConnectionState::Disconnected) => {
                warn!("Wi-Fi disconnected");
                self.context.network.ap_connected = false;
                self.context.network.address = None;
                self.cloud.reset(self.peripherals.transport.as_mut());
            }
            DriverEvent::AddressAssigned(address) => {
                info!(%address, "Address assigned");
                self.context.network.address = Some(address);
            }
            DriverEvent::TimeSynced(time) => {
                if time.timestamp() == UNSET_TIME_UTC {
                    debug!("Ignoring unset network time");
                } else {
                    info!(%time, "Network time updated");
                    self.context.network.last_time_sync = Some(time);
                }
            }
            DriverEvent::ProvisioningResult {
                credentials,
                success,
            } => self.on_wifi_provisioned(credentials, success),
        }
    }

    fn on_wifi_provisioned(&mut self, credentials: WifiCredentials, success: bool) {
        if !success {
            warn!(ssid = %credentials.ssid, "Wi-Fi provisioning failed");
            return;
        }

        info!(ssid = %credentials.ssid, "Wi-Fi credentials received");
        self.config.wifi = Some(credentials);
        self.config.wifi_mode = WifiMode::Default;
        if let Err(e) = self.config.save_to_file() {
            error!(error = %e, "Failed to persist Wi-Fi credentials");
        }
        if let Some(handle) = self.bringup.handle() {
            self.peripherals
                .driver
                .start(handle, WifiMode::Default, self.config.wifi.as_ref());
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(InboundMessage { topic, payload }) => self.on_message(&topic, &payload),
            TransportEvent::Acknowledged { pkid } => debug!(pkid, "Publish acknowledged"),
            TransportEvent::ProvisioningCompleted { hub_host } => self.on_provisioning_completed(hub_host),
        }
    }

    /// Route an inbound message by topic.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) {
        match parse_hub_topic(topic) {
            Ok(HubTopic::MethodRequest { name, request_id }) => {
                self.handle_command(CommandRequest { request_id, name }, payload)
            }
            Ok(HubTopic::Twin { kind, .. }) => self.handle_twin(kind, payload),
            Err(e) => warn!(error = %e, "Unhandled inbound message"),
        }
    }

    /// Command invocation entry point.
    pub fn on_command(&mut self, topic: &str, payload: &[u8]) {
        match parse_hub_topic(topic) {
            Ok(HubTopic::MethodRequest { name, request_id }) => {
                self.handle_command(CommandRequest { request_id, name }, payload)
            }
            Ok(_) => warn!(topic = %topic, "Not a command topic"),
            Err(e) => error!(error = %e, "Command topic not recognised"),
        }
    }

    /// Twin response entry point: GET responses and reported-patch acks.
    pub fn on_twin_get(&mut self, topic: &str, payload: &[u8]) {
        match parse_hub_topic(topic) {
            Ok(HubTopic::Twin { kind, .. }) if kind != TwinMessageKind::DesiredPatch => {
                self.handle_twin(kind, payload)
            }
            Ok(_) => warn!(topic = %topic, "Not a twin response topic"),
            Err(e) => error!(error = %e, "Twin topic not recognised"),
        }
    }

    /// Desired-property push entry point.
    pub fn on_twin_patch(&mut self, topic: &str, payload: &[u8]) {
        match parse_hub_topic(topic) {
            Ok(HubTopic::Twin {
                kind: TwinMessageKind::DesiredPatch,
                ..
            }) => self.handle_twin(TwinMessageKind::DesiredPatch, payload),
            Ok(_) => warn!(topic = %topic, "Not a desired property topic"),
            Err(e) => error!(error = %e, "Twin topic not recognised"),
        }
    }

    /// Hub assignment from the provisioning service: move the session to the
    /// hub and re-arm both periodic tasks.
    pub fn on_provisioning_completed(&mut self, hub_host: String) {
        info!(hub = %hub_host, "Provisioning complete, switching to hub");
        self.config.hub_hostname = hub_host.clone();
        self.cloud
            .retarget(Endpoint::Hub { host: hub_host }, self.peripherals.transport.as_mut());
        self.arm_timers();
    }

    fn handle_command(&mut self, request: CommandRequest, payload: &[u8]) {
        info!(command = %request.name, request_id = %request.request_id, "Command received");
        self.commands.respond(
            &request,
            payload,
            &self.context.telemetry,
            &Local::now(),
            self.peripherals.transport.as_mut(),
        );
    }

    fn handle_twin(&mut self, kind: TwinMessageKind, payload: &[u8]) {
        self.twin.handle_message(
            kind,
            payload,
            &mut self.context.request_ids,
            self.peripherals.transport.as_mut(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_context_starts_empty() {
        let context = DeviceContext::default();
        assert!(context.identity.is_none());
        assert_eq!(context.telemetry.sample_count(), 0);
        assert_eq!(context.network, NetworkStatus::default());
        assert_eq!(context.telemetry_buffer.capacity(), MessageBuffer::TELEMETRY);
    }
}

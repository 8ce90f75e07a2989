use rumqttc::{AsyncClient, Event, MqttOptions, Packet, TlsConfiguration, Transport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::provisioning::{DpsRegistration, DpsStep, OutboundRequest, DPS_RESPONSE_PREFIX, DPS_SUBSCRIPTION};
use crate::topics::HUB_SUBSCRIPTIONS;
use crate::types::DeviceId;

const HUB_API_VERSION: &str = "2021-04-12";
const EVENT_CAPACITY: usize = 32;

/// Delivery assurance for an outbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// Where a cloud session is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Provisioning { host: String, id_scope: String },
    Hub { host: String },
}

impl Endpoint {
    pub fn host(&self) -> &str {
        match self {
            Endpoint::Provisioning { host, .. } | Endpoint::Hub { host } => host,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Notifications delivered by the transport's own poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// Broker acknowledged an outbound publish.
    Acknowledged { pkid: u16 },
    /// The provisioning service assigned this device to a hub.
    ProvisioningCompleted { hub_host: String },
}

/// Publish/subscribe session used by the device core.
///
/// Every method must return promptly: the core calls them from its single
/// cooperative loop.
pub trait CloudTransport {
    fn connect(&mut self, endpoint: &Endpoint, device_id: &DeviceId) -> Result<(), TransportError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError>;
    fn poll(&mut self) -> Vec<TransportEvent>;
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub port: u16,
    pub keep_alive: Duration,
    pub model_id: String,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl From<&Config> for MqttSettings {
    fn from(config: &Config) -> Self {
        MqttSettings {
            port: config.mqtt_port,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            model_id: config.model_id.clone(),
            ca_cert: config.ca_cert.clone(),
            client_cert: config.client_cert.clone(),
            client_key: config.client_key.clone(),
        }
    }
}

enum LinkEvent {
    ConnAck,
    Publish { topic: String, payload: Vec<u8> },
    PubAck(u16),
    Lost(String),
}

struct Session {
    client: AsyncClient,
    link: UnboundedReceiver<LinkEvent>,
    task: JoinHandle<()>,
    registration: Option<DpsRegistration>,
}

/// MQTT transport backed by rumqttc.
///
/// The rumqttc event loop runs on its own task and only forwards events into
/// a channel; all protocol work happens in [`CloudTransport::poll`].
pub struct MqttTransport {
    settings: MqttSettings,
    connected: Arc<AtomicBool>,
    session: Option<Session>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        MqttTransport {
            settings,
            connected: Arc::new(AtomicBool::new(false)),
            session: None,
        }
    }

    fn options(&self, endpoint: &Endpoint, device_id: &DeviceId) -> Result<MqttOptions, TransportError> {
        let mut options = MqttOptions::new(device_id.as_str(), endpoint.host(), self.settings.port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        let username = match endpoint {
            Endpoint::Hub { host } => format!(
                "{host}/{device_id}/?api-version={HUB_API_VERSION}&model-id={}",
                self.settings.model_id
            ),
            Endpoint::Provisioning { id_scope, .. } => DpsRegistration::username(id_scope, device_id),
        };
        options.set_credentials(username, "");

        if let (Some(ca), Some(cert), Some(key)) = (
            &self.settings.ca_cert,
            &self.settings.client_cert,
            &self.settings.client_key,
        ) {
            let tls = TlsConfiguration::Simple {
                ca: load_pem(ca)?,
                alpn: None,
                client_auth: Some((load_pem(cert)?, load_pem(key)?)),
            };
            options.set_transport(Transport::tls_with_config(tls));
        }

        Ok(options)
    }

    fn send(&self, request: &OutboundRequest) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = session.client.try_publish(
            request.topic.as_str(),
            rumqttc::QoS::AtMostOnce,
            false,
            request.payload.clone(),
        ) {
            error!(topic = %request.topic, error = %e, "Failed to send provisioning request");
        }
    }

    fn subscribe_all(&self, topics: &[&str]) {
        let Some(session) = &self.session else {
            return;
        };
        for topic in topics {
            if let Err(e) = session.client.try_subscribe(*topic, rumqttc::QoS::AtMostOnce) {
                let e = TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                };
                error!(error = %e, "Failed to subscribe");
            }
        }
    }
}

impl CloudTransport for MqttTransport {
    fn connect(&mut self, endpoint: &Endpoint, device_id: &DeviceId) -> Result<(), TransportError> {
        self.disconnect();

        let options = self.options(endpoint, device_id)?;
        let (client, mut eventloop) = AsyncClient::new(options, EVENT_CAPACITY);
        let (tx, link) = mpsc::unbounded_channel();
        let connected = Arc::clone(&self.connected);

        info!(host = %endpoint.host(), device_id = %device_id, "Opening MQTT session");

        let task = tokio::spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        LinkEvent::ConnAck
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Publish {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    },
                    Ok(Event::Incoming(Packet::PubAck(ack))) => LinkEvent::PubAck(ack.pkid),
                    Ok(_) => continue,
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        let reason = e.to_string();
                        if forward(&tx, LinkEvent::Lost(reason)).is_err() {
                            break;
                        }
                        sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if forward(&tx, event).is_err() {
                    break;
                }
            }
        });

        let registration = match endpoint {
            Endpoint::Provisioning { .. } => Some(DpsRegistration::new(device_id)),
            Endpoint::Hub { .. } => None,
        };

        self.session = Some(Session {
            client,
            link,
            task,
            registration,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.client.try_disconnect() {
                debug!(error = %e, "Disconnect request not delivered");
            }
            session.task.abort();
            info!("MQTT session closed");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        let session = match &self.session {
            Some(session) if self.is_connected() => session,
            _ => return Err(TransportError::NotConnected),
        };
        session
            .client
            .try_publish(topic, qos.into(), false, payload.to_vec())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let mut outbound = Vec::new();
        let mut connack = false;

        if let Some(session) = self.session.as_mut() {
            loop {
                match session.link.try_recv() {
                    Ok(LinkEvent::ConnAck) => connack = true,
                    Ok(LinkEvent::Publish { topic, payload }) => {
                        match session.registration.as_mut() {
                            Some(registration) if topic.starts_with(DPS_RESPONSE_PREFIX) => {
                                match registration.on_response(&topic, &payload, Instant::now()) {
                                    DpsStep::Pending => {}
                                    DpsStep::Assigned { hub_host } => {
                                        info!(hub = %hub_host, "Device provisioned");
                                        events.push(TransportEvent::ProvisioningCompleted { hub_host });
                                    }
                                    DpsStep::Failed(e) => {
                                        error!(error = %e, "Device provisioning failed");
                                    }
                                }
                            }
                            _ => events.push(TransportEvent::Message(InboundMessage { topic, payload })),
                        }
                    }
                    Ok(LinkEvent::PubAck(pkid)) => events.push(TransportEvent::Acknowledged { pkid }),
                    Ok(LinkEvent::Lost(reason)) => warn!(reason = %reason, "MQTT connection error"),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            if let Some(registration) = session.registration.as_mut() {
                if connack {
                    match registration.register_request() {
                        Ok(request) => outbound.push(request),
                        Err(e) => error!(error = %e, "Failed to build registration request"),
                    }
                }
                match registration.due_request(Instant::now()) {
                    Ok(Some(request)) => outbound.push(request),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Failed to build operation status request"),
                }
            }
        }

        if connack {
            info!("MQTT session established");
            let provisioning = self
                .session
                .as_ref()
                .is_some_and(|session| session.registration.is_some());
            if provisioning {
                self.subscribe_all(&[DPS_SUBSCRIPTION]);
            } else {
                self.subscribe_all(&HUB_SUBSCRIPTIONS);
            }
        }
        for request in &outbound {
            self.send(request);
        }

        events
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

fn forward(tx: &UnboundedSender<LinkEvent>, event: LinkEvent) -> Result<(), ()> {
    tx.send(event).map_err(|_| ())
}

fn load_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|source| TransportError::Tls {
        path: path.display().to_string(),
        source,
    })
}

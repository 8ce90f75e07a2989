use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::topics::twin_get_topic;
use crate::transport::{CloudTransport, Endpoint, QoS};
use crate::types::{DeviceId, RequestIds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
}

/// Cloud session bookkeeping driven by the cloud tick.
///
/// The transport owns the wire; this only decides when to open a session,
/// notices when it comes up or drops, and asks for the full twin each time
/// a hub session is established.
#[derive(Debug)]
pub struct CloudSession {
    endpoint: Option<Endpoint>,
    state: SessionState,
}

impl Default for CloudSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudSession {
    pub fn new() -> Self {
        CloudSession {
            endpoint: None,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// True only while a session to the production hub is up. A session to
    /// the provisioning service does not count.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected && matches!(self.endpoint, Some(Endpoint::Hub { .. }))
    }

    /// Drop the current session and target `endpoint` from the next tick.
    pub fn retarget<T>(&mut self, endpoint: Endpoint, transport: &mut T)
    where
        T: CloudTransport + ?Sized,
    {
        info!(host = %endpoint.host(), "Cloud endpoint selected");
        transport.disconnect();
        self.endpoint = Some(endpoint);
        self.state = SessionState::Idle;
    }

    /// Close the session; a later tick reconnects once the network is up.
    pub fn reset<T>(&mut self, transport: &mut T)
    where
        T: CloudTransport + ?Sized,
    {
        if self.state != SessionState::Idle {
            info!("Resetting cloud session");
        }
        transport.disconnect();
        self.state = SessionState::Idle;
    }

    /// One cloud tick. Errors are connect failures; the session stays idle
    /// and the next tick tries again.
    pub fn tick<T>(
        &mut self,
        transport: &mut T,
        device_id: &DeviceId,
        network_up: bool,
        request_ids: &mut RequestIds,
    ) -> Result<(), TransportError>
    where
        T: CloudTransport + ?Sized,
    {
        let Some(endpoint) = self.endpoint.clone() else {
            return Ok(());
        };

        if self.state == SessionState::Idle {
            if !network_up {
                return Ok(());
            }
            transport.connect(&endpoint, device_id)?;
            self.state = SessionState::Connecting;
        }

        match (self.state, transport.is_connected()) {
            (SessionState::Connecting, true) => {
                info!(host = %endpoint.host(), "Cloud session connected");
                self.state = SessionState::Connected;
                if let Endpoint::Hub { .. } = endpoint {
                    request_twin(transport, request_ids);
                }
            }
            (SessionState::Connected, false) => {
                warn!(host = %endpoint.host(), "Cloud session lost");
                self.state = SessionState::Connecting;
            }
            _ => {}
        }
        Ok(())
    }
}

fn request_twin<T>(transport: &mut T, request_ids: &mut RequestIds)
where
    T: CloudTransport + ?Sized,
{
    let topic = twin_get_topic(&request_ids.next_id());
    debug!(topic = %topic, "Requesting device twin");
    if let Err(e) = transport.publish(&topic, b"", QoS::AtMostOnce) {
        error!(error = %e, "Failed to request device twin");
    }
}

//! A live session: one protocol client bound to one device identity.

use std::sync::{Arc, Mutex, PoisonError};

use {
    serde::Serialize,
    tokio::{
        sync::mpsc::{self, error::TrySendError},
        task::JoinHandle,
    },
    tracing::{debug, warn},
    wagate_channels::{ClientEvent, DeviceIdentity, ProtocolClient},
    wagate_sessions::SessionRecord,
};

/// Observable connection flags. Guarded by the registry lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub pairing_in_progress: bool,
}

/// API projection of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_phone: Option<String>,
    pub webhook_url: String,
    pub position: i64,
    pub created_at: i64,
    #[serde(flatten)]
    pub status: SessionStatus,
}

impl SessionView {
    pub fn new(profile: &SessionRecord, status: SessionStatus) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            phone: profile.phone.clone(),
            actual_phone: profile.actual_phone.clone(),
            webhook_url: profile.webhook_url.clone(),
            position: profile.position,
            created_at: profile.created_at,
            status,
        }
    }
}

/// Receiving ends of a session's client callbacks.
///
/// State transitions travel on an unbounded queue and are never shed.
/// Messages are bounded and dropped when the consumer falls behind.
pub struct SessionEvents {
    pub control: mpsc::UnboundedReceiver<ClientEvent>,
    pub messages: mpsc::Receiver<ClientEvent>,
}

impl SessionEvents {
    /// Next event, state transitions first. `None` once both queues close.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        tokio::select! {
            biased;
            Some(event) = self.control.recv() => Some(event),
            Some(event) = self.messages.recv() => Some(event),
            else => None,
        }
    }
}

pub struct Session {
    id: String,
    device_id: String,
    client: Arc<dyn ProtocolClient>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Bind `client` and route its callbacks into per-session queues. The
    /// returned [`SessionEvents`] is the only consumer of this session's events.
    pub fn new(
        id: &str,
        device: &DeviceIdentity,
        client: Arc<dyn ProtocolClient>,
        buffer: usize,
    ) -> (Self, SessionEvents) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::channel(buffer.max(1));
        let session_id = id.to_string();
        client.set_event_handler(Box::new(move |event| match event {
            ClientEvent::Message(_) => match message_tx.try_send(event) {
                Ok(()) => {},
                Err(TrySendError::Full(event)) => {
                    warn!(session_id = %session_id, ?event, "session message queue full, dropping message");
                },
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %session_id, "session message queue closed");
                },
            },
            event => {
                if control_tx.send(event).is_err() {
                    debug!(session_id = %session_id, "session event queue closed");
                }
            },
        }));

        let session = Self {
            id: id.to_string(),
            device_id: device.device_id.clone(),
            client,
            pump: Mutex::new(None),
        };
        let events = SessionEvents {
            control: control_rx,
            messages: message_rx,
        };
        (session, events)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub(crate) fn set_pump(&self, handle: JoinHandle<()>) {
        let previous = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop consuming client events.
    pub(crate) fn stop_events(&self) {
        if let Some(handle) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_events();
    }
}

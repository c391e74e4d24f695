use std::{sync::Arc, time::Duration};

use {anyhow::Result, async_trait::async_trait, tokio::sync::mpsc};

use crate::{device::DeviceIdentity, message::InboundMessage};

/// Connection-level notifications delivered through the client's event callback.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport is up. For a paired device this also means authenticated.
    Connected,
    /// Pairing completed; `jid` is the resolved network identity.
    PairSuccess { jid: String },
    /// Transport dropped. The client's own reconnect policy may bring it back.
    Disconnected,
    /// The account unlinked this device; it must be paired again.
    LoggedOut,
    Message(Box<InboundMessage>),
}

/// Events on the pairing channel of an unpaired client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A scannable code, valid for `timeout`.
    Code { code: String, timeout: Duration },
    Success,
    /// No code was scanned before the last one expired.
    Timeout,
    Error(String),
    /// Any other terminal notification, by name.
    Other(String),
}

impl PairingEvent {
    /// Every event except a code ends the pairing attempt.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Code { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Code { .. } => "code",
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Error(_) => "error",
            Self::Other(name) => name,
        }
    }
}

/// Callback registered on a client. Invoked on the client's own task, so it
/// must not block.
pub type EventHandler = Box<dyn Fn(ClientEvent) + Send + Sync>;

/// One live protocol connection, bound to a single device identity.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the transport. For an unpaired device, call [`pairing_events`]
    /// first; pairing codes flow once the transport is up.
    ///
    /// [`pairing_events`]: ProtocolClient::pairing_events
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    /// Unlink the device from the account and drop its identity from the
    /// device store. The identity is unusable afterwards.
    async fn logout(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    /// Receiver for the next pairing attempt. Fails if the device is already
    /// paired.
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>>;

    /// Register the connection/message callback, replacing any previous one.
    fn set_event_handler(&self, handler: EventHandler);

    /// Resolved network identity (JID), once authenticated.
    fn identity(&self) -> Option<String>;
}

/// Builds protocol clients and owns the device identity storage they use.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    fn devices(&self) -> Arc<dyn crate::device::DeviceStore>;

    async fn build(&self, device: DeviceIdentity) -> Result<Arc<dyn ProtocolClient>>;
}

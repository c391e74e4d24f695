//! In-process protocol client.
//!
//! Behaves like a real client from the gateway's point of view: unpaired
//! devices receive rotating pairing codes once connected and then either
//! pair (a generated identity is written to the device store) or time out;
//! paired devices connect straight away. Test hooks can inject inbound
//! messages, drop the transport, and make logout fail.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    dashmap::DashMap,
    rand::{Rng, distr::Alphanumeric},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    wagate_channels::{
        ClientEvent, ClientFactory, DeviceIdentity, DeviceStore, EventHandler, InboundMessage,
        PairingEvent, ProtocolClient,
    },
    wagate_config::LoopbackConfig,
};

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub code_count: u32,
    pub code_interval: Duration,
    pub code_timeout: Duration,
    pub auto_pair: bool,
    /// Leading digits of generated phone numbers.
    pub phone_prefix: String,
    /// Handshake time for an already paired device.
    pub connect_delay: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self::from(&LoopbackConfig::default())
    }
}

impl From<&LoopbackConfig> for LoopbackOptions {
    fn from(cfg: &LoopbackConfig) -> Self {
        Self {
            code_count: cfg.code_count.max(1),
            code_interval: Duration::from_millis(cfg.code_interval_ms),
            code_timeout: Duration::from_secs(cfg.code_timeout_secs),
            auto_pair: cfg.auto_pair,
            phone_prefix: "62".into(),
            connect_delay: Duration::ZERO,
        }
    }
}

fn pairing_code() -> String {
    let ref_part: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("2@{ref_part}")
}

fn generated_jid(prefix: &str) -> String {
    let mut rng = rand::rng();
    let digits: String = (0..10)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect();
    format!("{prefix}{digits}:{}@s.whatsapp.net", rng.random_range(1..40u8))
}

type SharedHandler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

struct Inner {
    device: Mutex<DeviceIdentity>,
    store: Arc<dyn DeviceStore>,
    options: LoopbackOptions,
    connected: AtomicBool,
    handler: Mutex<Option<SharedHandler>>,
    pairing_tx: Mutex<Option<mpsc::Sender<PairingEvent>>>,
    pairing_cancel: Mutex<Option<CancellationToken>>,
    fail_logout: AtomicBool,
    connects: AtomicUsize,
}

/// Cheaply cloneable handle; clones share the same connection.
#[derive(Clone)]
pub struct LoopbackClient {
    inner: Arc<Inner>,
}

impl LoopbackClient {
    pub fn new(device: DeviceIdentity, store: Arc<dyn DeviceStore>, options: LoopbackOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                device: Mutex::new(device),
                store,
                options,
                connected: AtomicBool::new(false),
                handler: Mutex::new(None),
                pairing_tx: Mutex::new(None),
                pairing_cancel: Mutex::new(None),
                fail_logout: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn device(&self) -> DeviceIdentity {
        self.inner
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Deliver an inbound message as if it came off the wire.
    pub fn inject(&self, message: InboundMessage) {
        self.emit(ClientEvent::Message(Box::new(message)));
    }

    /// Drop the transport without logging out, cancelling any pairing script.
    pub fn drop_connection(&self) {
        self.cancel_pairing();
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.emit(ClientEvent::Disconnected);
        }
    }

    pub fn set_fail_logout(&self, fail: bool) {
        self.inner.fail_logout.store(fail, Ordering::SeqCst);
    }

    fn emit(&self, event: ClientEvent) {
        let handler = self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(event),
            None => debug!(?event, "no event handler registered, dropping event"),
        }
    }

    fn cancel_pairing(&self) {
        if let Some(token) = self
            .inner
            .pairing_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    async fn run_pairing(self, tx: mpsc::Sender<PairingEvent>, cancel: CancellationToken) {
        let options = self.inner.options.clone();

        for _ in 0..options.code_count {
            let event = PairingEvent::Code {
                code: pairing_code(),
                timeout: options.code_timeout,
            };
            if tx.send(event).await.is_err() {
                debug!("pairing receiver dropped, stopping code rotation");
                return;
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tx.closed() => return,
                () = tokio::time::sleep(options.code_interval) => {},
            }
        }

        if !options.auto_pair {
            let _ = tx.send(PairingEvent::Timeout).await;
            if self.inner.connected.swap(false, Ordering::SeqCst) {
                self.emit(ClientEvent::Disconnected);
            }
            return;
        }

        let jid = generated_jid(&options.phone_prefix);
        let device = {
            let mut device = self
                .inner
                .device
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            device.jid = Some(jid.clone());
            device.clone()
        };
        if let Err(e) = self.inner.store.save(&device).await {
            warn!(device_id = %device.device_id, error = %e, "failed to persist paired device");
        }
        info!(device_id = %device.device_id, %jid, "loopback device paired");

        self.emit(ClientEvent::PairSuccess { jid });
        let _ = tx.send(PairingEvent::Success).await;
        self.emit(ClientEvent::Connected);
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    async fn connect(&self) -> Result<()> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        if self.is_logged_in() {
            let delay = self.inner.options.connect_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.inner.connected.store(true, Ordering::SeqCst);
            self.emit(ClientEvent::Connected);
            return Ok(());
        }

        let tx = self
            .inner
            .pairing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(tx) = tx else {
            bail!("device is not paired; request pairing events before connecting");
        };

        self.cancel_pairing();
        let cancel = CancellationToken::new();
        *self
            .inner
            .pairing_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());

        self.inner.connected.store(true, Ordering::SeqCst);
        tokio::spawn(self.clone().run_pairing(tx, cancel));
        Ok(())
    }

    async fn disconnect(&self) {
        self.cancel_pairing();
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.emit(ClientEvent::Disconnected);
        }
    }

    async fn logout(&self) -> Result<()> {
        if self.inner.fail_logout.load(Ordering::SeqCst) {
            bail!("logout rejected by server");
        }
        if !self.is_logged_in() {
            bail!("device is not logged in");
        }

        let device_id = {
            let mut device = self
                .inner
                .device
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            device.jid = None;
            device.device_id.clone()
        };
        self.inner.store.delete(&device_id).await?;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.emit(ClientEvent::LoggedOut);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn is_logged_in(&self) -> bool {
        self.inner
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_authenticated()
    }

    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>> {
        if self.is_logged_in() {
            bail!("device is already paired");
        }
        let (tx, rx) = mpsc::channel(8);
        *self
            .inner
            .pairing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    fn set_event_handler(&self, handler: EventHandler) {
        *self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(handler));
    }

    fn identity(&self) -> Option<String> {
        self.inner
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .jid
            .clone()
    }
}

/// Builds loopback clients and keeps a handle to each one by device id.
pub struct LoopbackFactory {
    store: Arc<dyn DeviceStore>,
    options: LoopbackOptions,
    clients: DashMap<String, LoopbackClient>,
}

impl LoopbackFactory {
    pub fn new(store: Arc<dyn DeviceStore>, options: LoopbackOptions) -> Self {
        Self {
            store,
            options,
            clients: DashMap::new(),
        }
    }

    /// The most recently built client for `device_id`.
    pub fn client(&self, device_id: &str) -> Option<LoopbackClient> {
        self.clients.get(device_id).map(|c| c.value().clone())
    }
}

#[async_trait]
impl ClientFactory for LoopbackFactory {
    fn devices(&self) -> Arc<dyn DeviceStore> {
        Arc::clone(&self.store)
    }

    async fn build(&self, device: DeviceIdentity) -> Result<Arc<dyn ProtocolClient>> {
        let device_id = device.device_id.clone();
        let client = LoopbackClient::new(device, Arc::clone(&self.store), self.options.clone());
        self.clients.insert(device_id, client.clone());
        Ok(Arc::new(client))
    }
}

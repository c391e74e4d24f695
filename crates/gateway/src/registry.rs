//! In-memory session registry.
//!
//! The map and each session's status flags sit behind one `std` reader/writer
//! lock. The lock is only held for map access and flag updates, never across
//! an `.await`; connect, logout, pairing and persistence all run outside it.
//!
//! Every long-running path re-validates membership with [`Arc::ptr_eq`]
//! before touching an entry, so work finishing after a delete (or a delete
//! followed by a re-create under the same id) is discarded.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, error, info, warn},
    wagate_channels::{ClientEvent, ClientFactory, DeviceIdentity, jid},
    wagate_config::SessionsConfig,
    wagate_sessions::{SessionId, SessionRecord, SqliteSessionMetadata},
};

use crate::{
    error::{GatewayError, GatewayResult},
    pairing::PairingGuard,
    session::{Session, SessionEvents, SessionStatus, SessionView},
    webhook::WebhookDispatcher,
};

const ID_ATTEMPTS: usize = 16;

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateSession {
    pub id: Option<String>,
    pub name: String,
    pub webhook_url: String,
}

/// Partial update. Absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateSession {
    pub name: Option<String>,
    pub webhook_url: Option<String>,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    pub total: usize,
    pub connected: usize,
    pub authenticated: usize,
}

// ── Registry ─────────────────────────────────────────────────────────────────

struct Entry {
    session: Arc<Session>,
    profile: SessionRecord,
    status: SessionStatus,
    latest_qr: Option<String>,
}

struct Shared {
    sessions: RwLock<HashMap<String, Entry>>,
    factory: Arc<dyn ClientFactory>,
    metadata: SqliteSessionMetadata,
    webhooks: WebhookDispatcher,
    config: SessionsConfig,
}

/// Cheaply cloneable handle to the registry.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

/// Empty stays empty; anything else must be an absolute http(s) URL.
fn normalize_webhook(raw: &str) -> GatewayResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(String::new());
    }
    let url = url::Url::parse(raw)
        .map_err(|e| GatewayError::BadRequest(format!("invalid webhook_url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::BadRequest(
            "webhook_url must use http or https".into(),
        ));
    }
    Ok(url.to_string())
}

fn find_by_phone<'a>(
    devices: &'a [DeviceIdentity],
    claimed: &HashSet<String>,
    phone: &str,
) -> Option<&'a DeviceIdentity> {
    devices
        .iter()
        .filter(|d| !claimed.contains(&d.device_id))
        .find(|d| d.phone() == Some(phone))
}

/// Stored device for a persisted session: by resolved identity first, then
/// by the identity requested at creation. Devices already handed to another
/// session are skipped.
pub fn match_device<'a>(
    record: &SessionRecord,
    devices: &'a [DeviceIdentity],
    claimed: &HashSet<String>,
) -> Option<&'a DeviceIdentity> {
    record
        .actual_phone
        .as_deref()
        .and_then(|phone| find_by_phone(devices, claimed, phone))
        .or_else(|| find_by_phone(devices, claimed, &record.phone))
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        metadata: SqliteSessionMetadata,
        webhooks: WebhookDispatcher,
        config: SessionsConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                factory,
                metadata,
                webhooks,
                config,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metadata(&self) -> &SqliteSessionMetadata {
        &self.shared.metadata
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> GatewayResult<SessionView> {
        self.read()
            .get(id)
            .map(|e| SessionView::new(&e.profile, e.status))
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// All sessions by position, then creation time.
    pub fn list(&self) -> Vec<SessionView> {
        let mut views: Vec<_> = self
            .read()
            .values()
            .map(|e| SessionView::new(&e.profile, e.status))
            .collect();
        views.sort_by(|a, b| {
            (a.position, a.created_at, &a.id).cmp(&(b.position, b.created_at, &b.id))
        });
        views
    }

    pub fn session(&self, id: &str) -> GatewayResult<Arc<Session>> {
        self.read()
            .get(id)
            .map(|e| Arc::clone(&e.session))
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn status(&self, id: &str) -> GatewayResult<SessionStatus> {
        self.read()
            .get(id)
            .map(|e| e.status)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> SessionCounts {
        let sessions = self.read();
        SessionCounts {
            total: sessions.len(),
            connected: sessions.values().filter(|e| e.status.connected).count(),
            authenticated: sessions.values().filter(|e| e.status.authenticated).count(),
        }
    }

    /// Most recent pairing code of an in-flight pairing.
    pub fn latest_qr(&self, id: &str) -> GatewayResult<Option<String>> {
        self.read()
            .get(id)
            .map(|e| e.latest_qr.clone())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }

    /// Run `f` on the entry still owned by `session`. `None` once the session
    /// has been removed or replaced.
    fn with_entry<R>(&self, session: &Arc<Session>, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let mut sessions = self.write();
        sessions
            .get_mut(session.id())
            .filter(|e| Arc::ptr_eq(&e.session, session))
            .map(f)
    }

    fn is_current(&self, session: &Arc<Session>) -> bool {
        self.read()
            .get(session.id())
            .is_some_and(|e| Arc::ptr_eq(&e.session, session))
    }

    fn view_of(&self, session: &Arc<Session>) -> GatewayResult<SessionView> {
        self.read()
            .get(session.id())
            .filter(|e| Arc::ptr_eq(&e.session, session))
            .map(|e| SessionView::new(&e.profile, e.status))
            .ok_or_else(|| GatewayError::NotFound(session.id().to_string()))
    }

    fn remove_entry(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.write();
        let current = sessions
            .get(session.id())
            .is_some_and(|e| Arc::ptr_eq(&e.session, session));
        if current {
            sessions.remove(session.id());
        }
        current
    }

    fn generate_id(&self) -> GatewayResult<SessionId> {
        let sessions = self.read();
        (0..ID_ATTEMPTS)
            .map(|_| SessionId::generate())
            .find(|id| !sessions.contains_key(id.as_str()))
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("could not allocate a unique session id")))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Build a client for `device`, insert the session and start its event
    /// pump. With `persist`, also upsert the metadata row and undo the insert
    /// if that fails.
    async fn install(
        &self,
        record: SessionRecord,
        device: DeviceIdentity,
        persist: bool,
    ) -> GatewayResult<Arc<Session>> {
        let client = self.shared.factory.build(device.clone()).await?;
        let (session, events) =
            Session::new(&record.id, &device, client, self.shared.config.event_buffer);
        let session = Arc::new(session);

        {
            let mut sessions = self.write();
            if sessions.contains_key(&record.id) {
                return Err(GatewayError::Conflict(format!(
                    "session {} already exists",
                    record.id
                )));
            }
            sessions.insert(record.id.clone(), Entry {
                session: Arc::clone(&session),
                profile: record.clone(),
                status: SessionStatus {
                    authenticated: device.is_authenticated(),
                    ..SessionStatus::default()
                },
                latest_qr: None,
            });
        }
        self.spawn_pump(&session, events);

        if persist && let Err(e) = self.shared.metadata.upsert(&record).await {
            self.remove_entry(&session);
            session.stop_events();
            return Err(e.into());
        }
        Ok(session)
    }

    pub async fn create(&self, req: CreateSession) -> GatewayResult<SessionView> {
        let webhook_url = normalize_webhook(&req.webhook_url)?;
        let id = match req.id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => {
                let id =
                    SessionId::parse(raw).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
                if self.contains(id.as_str()) {
                    return Err(GatewayError::Conflict(format!("session {id} already exists")));
                }
                id
            },
            None => self.generate_id()?,
        };

        let mut record = SessionRecord::new(id.as_str(), req.name.trim(), webhook_url);
        record.position = self.shared.metadata.next_position().await?;

        // Same path as a restore that found no usable device.
        let devices = self.shared.factory.devices();
        let device = devices.create().await?;
        let session = match self.install(record, device.clone(), true).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(del) = devices.delete(&device.device_id).await {
                    warn!(device_id = %device.device_id, error = %del, "failed to discard unused device");
                }
                return Err(e);
            },
        };

        info!(session_id = %id, device_id = %session.device_id(), "session created");
        self.view_of(&session)
    }

    /// Rebuild one session per metadata row. Sessions whose device identity
    /// is still authenticated reconnect in the background.
    pub async fn restore_all(&self) -> anyhow::Result<Vec<SessionView>> {
        let records = self.shared.metadata.list().await?;
        let devices = self.shared.factory.devices();
        let stored = devices.list().await?;

        let mut claimed = HashSet::new();
        let mut restored = Vec::with_capacity(records.len());
        let mut reconnecting = 0usize;

        for record in records {
            if self.contains(&record.id) {
                warn!(session_id = %record.id, "session already live, skipping restore");
                continue;
            }

            let device = match match_device(&record, &stored, &claimed) {
                Some(device) => device.clone(),
                None => {
                    warn!(
                        session_id = %record.id,
                        phone = %record.best_phone(),
                        "no stored device identity matches, session will need pairing"
                    );
                    match devices.create().await {
                        Ok(device) => device,
                        Err(e) => {
                            error!(session_id = %record.id, error = %e, "failed to allocate device identity");
                            continue;
                        },
                    }
                },
            };
            claimed.insert(device.device_id.clone());

            let id = record.id.clone();
            let authenticated = device.is_authenticated();
            let session = match self.install(record, device, false).await {
                Ok(session) => session,
                Err(e) => {
                    error!(session_id = %id, error = %e, "failed to restore session");
                    continue;
                },
            };

            if authenticated && self.shared.config.reconnect_on_start {
                self.spawn_reconnect(Arc::clone(&session));
                reconnecting += 1;
            }
            restored.push(self.view_of(&session)?);
        }

        // Unpaired devices nobody claimed carry no credentials worth keeping.
        for device in stored
            .iter()
            .filter(|d| !d.is_authenticated() && !claimed.contains(&d.device_id))
        {
            match devices.delete(&device.device_id).await {
                Ok(()) => debug!(device_id = %device.device_id, "pruned orphan device"),
                Err(e) => warn!(device_id = %device.device_id, error = %e, "failed to prune orphan device"),
            }
        }

        info!(sessions = restored.len(), reconnecting, "sessions restored");
        Ok(restored)
    }

    fn spawn_reconnect(&self, session: Arc<Session>) {
        let registry = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let still_current = |registry: &Weak<Shared>| {
                registry
                    .upgrade()
                    .map(|shared| SessionRegistry { shared })
                    .filter(|r| r.is_current(&session))
            };

            if still_current(&registry).is_none() {
                return;
            }
            if let Err(e) = session.client().connect().await {
                warn!(session_id = %session.id(), error = %e, "reconnect failed");
                return;
            }

            match still_current(&registry) {
                Some(registry) => {
                    let client = Arc::clone(session.client());
                    registry.with_entry(&session, |e| {
                        e.status.connected = client.is_connected();
                        e.status.authenticated = client.is_logged_in();
                    });
                    info!(session_id = %session.id(), "session reconnected");
                },
                None => {
                    info!(session_id = %session.id(), "session removed while reconnecting, dropping connection");
                    session.client().disconnect().await;
                },
            }
        });
    }

    pub async fn update(&self, id: &str, update: UpdateSession) -> GatewayResult<SessionView> {
        let session = self.session(id)?;
        let webhook_url = update
            .webhook_url
            .as_deref()
            .map(normalize_webhook)
            .transpose()?;
        let name = update.name.as_deref().map(str::trim);

        let metadata = &self.shared.metadata;
        if let Some(name) = name {
            metadata.set_name(id, name).await?;
        }
        if let Some(url) = &webhook_url {
            metadata.set_webhook_url(id, url).await?;
        }
        if let Some(position) = update.position {
            metadata.set_position(id, position).await?;
        }

        self.with_entry(&session, |e| {
            if let Some(name) = name {
                e.profile.name = name.to_string();
            }
            if let Some(url) = webhook_url {
                e.profile.webhook_url = url;
            }
            if let Some(position) = update.position {
                e.profile.position = position;
            }
        })
        .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;

        debug!(session_id = id, "session updated");
        self.view_of(&session)
    }

    pub async fn connect(&self, id: &str) -> GatewayResult<SessionView> {
        let session = self.session(id)?;
        let status = self.status(id)?;
        let client = Arc::clone(session.client());

        if status.pairing_in_progress {
            return Err(GatewayError::Conflict("pairing in progress".into()));
        }
        if !client.is_logged_in() {
            return Err(GatewayError::Conflict("session requires pairing".into()));
        }
        if !client.is_connected() {
            client
                .connect()
                .await
                .map_err(|e| GatewayError::Internal(e.context("connect")))?;
            // A delete may have landed while the handshake was in flight.
            if !self.is_current(&session) {
                info!(session_id = id, "session removed while connecting, dropping connection");
                client.disconnect().await;
                return Err(GatewayError::NotFound(id.to_string()));
            }
            info!(session_id = id, "session connected");
        }

        self.with_entry(&session, |e| {
            e.status.connected = client.is_connected();
            e.status.authenticated = client.is_logged_in();
        });
        self.view_of(&session)
    }

    pub async fn disconnect(&self, id: &str) -> GatewayResult<SessionView> {
        let session = self.session(id)?;
        let client = Arc::clone(session.client());
        if !client.is_connected() {
            return Err(GatewayError::Unavailable(format!(
                "session {id} is not connected"
            )));
        }

        client.disconnect().await;
        self.with_entry(&session, |e| e.status.connected = false);
        info!(session_id = id, "session disconnected");
        self.view_of(&session)
    }

    /// Best-effort logout, then drop the session from memory, metadata and
    /// device storage. Logout failure never blocks the delete.
    pub async fn delete(&self, id: &str) -> GatewayResult<()> {
        let session = self.session(id)?;
        let client = Arc::clone(session.client());

        let mut logged_out = false;
        if client.is_logged_in() {
            match tokio::time::timeout(self.shared.config.logout_timeout(), client.logout()).await
            {
                Ok(Ok(())) => {
                    logged_out = true;
                    debug!(session_id = id, "logged out before delete");
                },
                Ok(Err(e)) => warn!(session_id = id, error = %e, "logout failed, deleting anyway"),
                Err(_) => warn!(session_id = id, "logout timed out, deleting anyway"),
            }
        }
        client.disconnect().await;

        if !self.remove_entry(&session) {
            return Err(GatewayError::NotFound(id.to_string()));
        }
        session.stop_events();

        let removed = self.shared.metadata.remove(id).await;
        // A successful logout already cleared the device from storage.
        if !logged_out
            && let Err(e) = self.shared.factory.devices().delete(session.device_id()).await
        {
            warn!(session_id = id, error = %e, "failed to delete device identity");
        }
        removed?;

        info!(session_id = id, "session deleted");
        Ok(())
    }

    /// Disconnect every session without logging out.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self
            .read()
            .values()
            .map(|e| Arc::clone(&e.session))
            .collect();
        for session in sessions {
            session.stop_events();
            session.client().disconnect().await;
        }
    }

    // ── Pairing support ──────────────────────────────────────────────────────

    /// Claim the single pairing slot of `id`.
    pub fn begin_pairing(&self, id: &str) -> GatewayResult<PairingGuard> {
        let mut sessions = self.write();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;

        if entry.status.pairing_in_progress {
            return Err(GatewayError::Conflict("pairing already in progress".into()));
        }
        // The client is authoritative; the cached flag may lag a logout.
        if entry.session.client().is_logged_in() {
            return Err(GatewayError::Conflict("session is already paired".into()));
        }
        entry.status.authenticated = false;
        entry.status.pairing_in_progress = true;
        entry.latest_qr = None;
        Ok(PairingGuard::new(self.clone(), Arc::clone(&entry.session)))
    }

    pub(crate) fn end_pairing(&self, session: &Arc<Session>) {
        self.with_entry(session, |e| {
            e.status.pairing_in_progress = false;
            e.latest_qr = None;
        });
    }

    pub(crate) fn set_latest_qr(&self, session: &Arc<Session>, code: &str) {
        self.with_entry(session, |e| e.latest_qr = Some(code.to_string()));
    }

    /// Flip the flags and persist the resolved identity after pairing.
    pub(crate) async fn mark_paired(&self, session: &Arc<Session>) {
        self.with_entry(session, |e| {
            e.status.connected = true;
            e.status.authenticated = true;
            e.latest_qr = None;
        });
        match session.client().identity() {
            Some(jid) => self.record_identity(session, &jid).await,
            None => warn!(session_id = %session.id(), "paired client reports no identity"),
        }
    }

    /// Store the phone part of `jid` as the resolved identity. Persistence
    /// failures are logged; memory stays authoritative.
    async fn record_identity(&self, session: &Arc<Session>, jid: &str) {
        let phone = jid::user_of(jid).to_string();
        let changed = self
            .with_entry(session, |e| {
                if e.profile.actual_phone.as_deref() == Some(phone.as_str()) {
                    return false;
                }
                e.profile.actual_phone = Some(phone.clone());
                true
            })
            .unwrap_or(false);

        if changed {
            match self.shared.metadata.set_actual_phone(session.id(), &phone).await {
                Ok(_) => info!(session_id = %session.id(), %phone, "resolved identity saved"),
                Err(e) => warn!(session_id = %session.id(), error = %e, "failed to save resolved identity"),
            }
        }
    }

    // ── Event pump ───────────────────────────────────────────────────────────

    fn spawn_pump(&self, session: &Arc<Session>, events: SessionEvents) {
        let handle = tokio::spawn(pump_events(
            Arc::downgrade(&self.shared),
            Arc::downgrade(session),
            events,
        ));
        session.set_pump(handle);
    }

    async fn handle_event(&self, session: &Arc<Session>, event: ClientEvent) {
        let id = session.id();
        match event {
            ClientEvent::Connected => {
                let logged_in = session.client().is_logged_in();
                self.with_entry(session, |e| {
                    e.status.connected = true;
                    e.status.authenticated |= logged_in;
                });
                debug!(session_id = id, "connected");
            },
            ClientEvent::PairSuccess { jid } => {
                self.with_entry(session, |e| e.status.authenticated = true);
                self.record_identity(session, &jid).await;
            },
            ClientEvent::Disconnected => {
                self.with_entry(session, |e| e.status.connected = false);
                debug!(session_id = id, "disconnected");
            },
            ClientEvent::LoggedOut => {
                self.with_entry(session, |e| {
                    e.status.connected = false;
                    e.status.authenticated = false;
                });
                warn!(session_id = id, "device logged out, session needs pairing");
            },
            ClientEvent::Message(msg) => {
                let Some(url) = self.with_entry(session, |e| e.profile.webhook_url.clone()) else {
                    return;
                };
                self.shared.webhooks.dispatch(id, &url, &msg);
            },
        }
    }
}

/// Drain one session's event queue until the session or registry goes away.
async fn pump_events(
    registry: Weak<Shared>,
    session: Weak<Session>,
    mut events: SessionEvents,
) {
    while let Some(event) = events.recv().await {
        let (Some(shared), Some(session)) = (registry.upgrade(), session.upgrade()) else {
            break;
        };
        SessionRegistry { shared }
            .handle_event(&session, event)
            .await;
    }
}

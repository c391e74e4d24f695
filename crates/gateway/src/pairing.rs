//! Device-pairing bridge.
//!
//! Turns a client's pairing-event stream into JSON frames for the browser.
//! One attempt per session at a time, guarded by [`PairingGuard`]. Every
//! attempt ends with exactly one terminal frame.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
    wagate_channels::PairingEvent,
};

use crate::{registry::SessionRegistry, session::Session};

// ── Wire frames ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PairingFrame {
    Qr { data: QrData },
    Success { message: String },
    Error { error: String },
    Event { event: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QrData {
    pub qr: String,
    /// Validity window in nanoseconds.
    pub timeout: u64,
}

impl PairingFrame {
    fn qr(code: String, timeout: Duration) -> Self {
        Self::Qr {
            data: QrData {
                qr: code,
                timeout: u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX),
            },
        }
    }

    fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    fn event(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Event {
            event: event.into(),
            message: message.into(),
        }
    }
}

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    AwaitingCode,
    CodeIssued,
    Succeeded,
    TimedOut,
    /// The connection went away before a terminal event.
    Superseded,
    Failed,
}

impl PairingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::TimedOut | Self::Superseded | Self::Failed
        )
    }

    pub fn start(self) -> Self {
        match self {
            Self::Idle => Self::AwaitingCode,
            other => other,
        }
    }

    /// Advance on a client event. Terminal phases absorb everything.
    pub fn on_event(self, event: &PairingEvent) -> Self {
        if self.is_terminal() {
            return self;
        }
        match event {
            PairingEvent::Code { .. } => Self::CodeIssued,
            PairingEvent::Success => Self::Succeeded,
            PairingEvent::Timeout => Self::TimedOut,
            PairingEvent::Error(_) | PairingEvent::Other(_) => Self::Failed,
        }
    }

    pub fn supersede(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            Self::Superseded
        }
    }
}

// ── Guard ────────────────────────────────────────────────────────────────────

/// Holds a session's pairing slot. Dropping it clears `pairing_in_progress`.
pub struct PairingGuard {
    registry: SessionRegistry,
    session: Arc<Session>,
}

impl PairingGuard {
    pub(crate) fn new(registry: SessionRegistry, session: Arc<Session>) -> Self {
        Self { registry, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for PairingGuard {
    fn drop(&mut self) {
        self.registry.end_pairing(&self.session);
    }
}

// ── Bridge ───────────────────────────────────────────────────────────────────

/// Release the slot, then deliver the terminal frame.
async fn finish(
    guard: PairingGuard,
    frames: &mpsc::Sender<PairingFrame>,
    frame: PairingFrame,
    phase: PairingPhase,
) -> PairingPhase {
    drop(guard);
    if frames.send(frame).await.is_err() {
        debug!(?phase, "pairing channel gone before terminal frame");
    }
    phase
}

/// Drive one pairing attempt, pushing frames into `frames` until a terminal
/// transition, `timeout`, or the receiver going away.
pub async fn run_pairing(
    registry: SessionRegistry,
    guard: PairingGuard,
    frames: mpsc::Sender<PairingFrame>,
    timeout: Duration,
) -> PairingPhase {
    let session = Arc::clone(guard.session());
    let session_id = session.id().to_string();
    let client = Arc::clone(session.client());

    // Never leave two half-open sockets for one identity.
    if client.is_connected() && !client.is_logged_in() {
        debug!(session_id = %session_id, "dropping stale unauthenticated connection");
        client.disconnect().await;
    }

    let mut events = match client.pairing_events().await {
        Ok(events) => events,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "pairing unavailable");
            return finish(guard, &frames, PairingFrame::error(e.to_string()), PairingPhase::Failed)
                .await;
        },
    };
    if let Err(e) = client.connect().await {
        warn!(session_id = %session_id, error = %e, "connect for pairing failed");
        return finish(guard, &frames, PairingFrame::error(e.to_string()), PairingPhase::Failed)
            .await;
    }

    let mut phase = PairingPhase::Idle.start();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = frames.closed() => {
                info!(session_id = %session_id, "pairing channel closed by client, cancelling");
                if !client.is_logged_in() {
                    client.disconnect().await;
                }
                return phase.supersede();
            },
            () = &mut deadline => {
                warn!(session_id = %session_id, timeout_secs = timeout.as_secs(), "pairing timed out");
                if !client.is_logged_in() {
                    client.disconnect().await;
                }
                let frame = PairingFrame::event("timeout", "pairing timed out");
                return finish(guard, &frames, frame, PairingPhase::TimedOut).await;
            },
            event = events.recv() => {
                let Some(event) = event else {
                    warn!(session_id = %session_id, "pairing stream ended without a result");
                    if !client.is_logged_in() {
                        client.disconnect().await;
                    }
                    let frame = PairingFrame::error("pairing interrupted: connection lost");
                    return finish(guard, &frames, frame, phase.supersede()).await;
                };
                phase = phase.on_event(&event);

                match event {
                    PairingEvent::Code { code, timeout } => {
                        debug!(session_id = %session_id, "pairing code issued");
                        registry.set_latest_qr(&session, &code);
                        // A closed receiver is picked up by the next select.
                        let _ = frames.send(PairingFrame::qr(code, timeout)).await;
                    },
                    PairingEvent::Success => {
                        registry.mark_paired(&session).await;
                        info!(session_id = %session_id, "pairing succeeded");
                        let frame = PairingFrame::Success {
                            message: "Login successful".into(),
                        };
                        return finish(guard, &frames, frame, phase).await;
                    },
                    PairingEvent::Timeout => {
                        info!(session_id = %session_id, "pairing code expired");
                        let frame = PairingFrame::event("timeout", "QR code expired, request pairing again");
                        return finish(guard, &frames, frame, phase).await;
                    },
                    PairingEvent::Error(error) => {
                        warn!(session_id = %session_id, %error, "pairing failed");
                        return finish(guard, &frames, PairingFrame::error(error), phase).await;
                    },
                    PairingEvent::Other(name) => {
                        warn!(session_id = %session_id, event = %name, "pairing ended");
                        let message = format!("pairing ended: {name}");
                        return finish(guard, &frames, PairingFrame::event(name, message), phase)
                            .await;
                    },
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{registry::CreateSession, webhook::WebhookDispatcher},
        wagate_channels::{ClientFactory, DeviceStore},
        wagate_config::{SessionsConfig, WebhookConfig},
        wagate_sessions::SqliteSessionMetadata,
        wagate_whatsapp::{LoopbackFactory, LoopbackOptions, MemoryDeviceStore},
    };

    async fn registry(options: LoopbackOptions) -> SessionRegistry {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        SqliteSessionMetadata::init(&pool).await.unwrap();
        let store: Arc<dyn DeviceStore> = Arc::new(MemoryDeviceStore::new());
        let factory: Arc<dyn ClientFactory> = Arc::new(LoopbackFactory::new(store, options));
        let registry = SessionRegistry::new(
            factory,
            SqliteSessionMetadata::new(pool),
            WebhookDispatcher::new(&WebhookConfig::default()).unwrap(),
            SessionsConfig::default(),
        );
        registry
            .create(CreateSession {
                id: Some("9999999999".into()),
                ..CreateSession::default()
            })
            .await
            .unwrap();
        registry
    }

    fn options(code_count: u32, auto_pair: bool) -> LoopbackOptions {
        LoopbackOptions {
            code_count,
            code_interval: Duration::from_millis(5),
            code_timeout: Duration::from_secs(20),
            auto_pair,
            phone_prefix: "62".into(),
            connect_delay: Duration::ZERO,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<PairingFrame>) -> Vec<PairingFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn frames_serialize_to_wire_format() {
        let qr = PairingFrame::qr("2@abc".into(), Duration::from_secs(20));
        assert_eq!(
            serde_json::to_value(&qr).unwrap(),
            serde_json::json!({"type": "qr", "data": {"qr": "2@abc", "timeout": 20_000_000_000u64}})
        );
        let ok = PairingFrame::Success {
            message: "Login successful".into(),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"type": "success", "message": "Login successful"})
        );
        assert_eq!(
            serde_json::to_value(PairingFrame::error("boom")).unwrap(),
            serde_json::json!({"type": "error", "error": "boom"})
        );
        assert_eq!(
            serde_json::to_value(PairingFrame::event("timeout", "x")).unwrap(),
            serde_json::json!({"type": "event", "event": "timeout", "message": "x"})
        );
    }

    #[test]
    fn phase_transitions() {
        let code = PairingEvent::Code {
            code: "c".into(),
            timeout: Duration::from_secs(1),
        };
        let phase = PairingPhase::Idle.start();
        assert_eq!(phase, PairingPhase::AwaitingCode);
        let phase = phase.on_event(&code).on_event(&code);
        assert_eq!(phase, PairingPhase::CodeIssued);
        assert_eq!(phase.on_event(&PairingEvent::Success), PairingPhase::Succeeded);
        assert_eq!(phase.on_event(&PairingEvent::Timeout), PairingPhase::TimedOut);
        assert_eq!(
            phase.on_event(&PairingEvent::Error("x".into())),
            PairingPhase::Failed
        );
        assert_eq!(phase.supersede(), PairingPhase::Superseded);

        let done = PairingPhase::Succeeded;
        assert_eq!(done.on_event(&code), PairingPhase::Succeeded);
        assert_eq!(done.supersede(), PairingPhase::Succeeded);
        assert!(!PairingPhase::CodeIssued.is_terminal());
    }

    #[tokio::test]
    async fn codes_then_success() {
        let registry = registry(options(3, true)).await;
        let guard = registry.begin_pairing("9999999999").unwrap();
        let (tx, rx) = mpsc::channel(16);

        let phase = run_pairing(registry.clone(), guard, tx, Duration::from_secs(5)).await;
        assert_eq!(phase, PairingPhase::Succeeded);

        let frames = collect(rx).await;
        assert_eq!(frames.len(), 4);
        assert!(frames[..3].iter().all(|f| matches!(f, PairingFrame::Qr { .. })));
        assert!(matches!(frames[3], PairingFrame::Success { .. }));

        let status = registry.status("9999999999").unwrap();
        assert!(status.authenticated && status.connected);
        assert!(!status.pairing_in_progress);
        assert!(registry.get("9999999999").unwrap().actual_phone.is_some());
        assert!(registry.latest_qr("9999999999").unwrap().is_none());

        // Already paired.
        assert!(registry.begin_pairing("9999999999").is_err());
    }

    #[tokio::test]
    async fn client_timeout_is_terminal_event() {
        let registry = registry(options(1, false)).await;
        let guard = registry.begin_pairing("9999999999").unwrap();
        let (tx, rx) = mpsc::channel(16);

        let phase = run_pairing(registry.clone(), guard, tx, Duration::from_secs(5)).await;
        assert_eq!(phase, PairingPhase::TimedOut);

        let frames = collect(rx).await;
        assert!(matches!(frames.first(), Some(PairingFrame::Qr { .. })));
        assert!(matches!(
            frames.last(),
            Some(PairingFrame::Event { event, .. }) if event == "timeout"
        ));

        let status = registry.status("9999999999").unwrap();
        assert!(!status.pairing_in_progress);
        assert!(!status.authenticated);
        // A new attempt may start.
        drop(registry.begin_pairing("9999999999").unwrap());
    }

    #[tokio::test]
    async fn overall_deadline_ends_attempt() {
        let mut slow = options(1000, true);
        slow.code_interval = Duration::from_millis(50);
        let registry = registry(slow).await;
        let guard = registry.begin_pairing("9999999999").unwrap();
        let (tx, rx) = mpsc::channel(64);

        let phase = run_pairing(registry.clone(), guard, tx, Duration::from_millis(120)).await;
        assert_eq!(phase, PairingPhase::TimedOut);
        let frames = collect(rx).await;
        assert!(matches!(frames.last(), Some(PairingFrame::Event { .. })));
        assert!(!registry.status("9999999999").unwrap().pairing_in_progress);
        assert!(!registry.session("9999999999").unwrap().client().is_connected());
    }

    #[tokio::test]
    async fn closing_the_channel_cancels() {
        let mut slow = options(1000, true);
        slow.code_interval = Duration::from_millis(50);
        let registry = registry(slow).await;
        let guard = registry.begin_pairing("9999999999").unwrap();
        let (tx, mut rx) = mpsc::channel(64);

        let task = tokio::spawn(run_pairing(registry.clone(), guard, tx, Duration::from_secs(30)));
        assert!(matches!(rx.recv().await, Some(PairingFrame::Qr { .. })));
        assert!(registry.status("9999999999").unwrap().pairing_in_progress);
        assert!(registry.latest_qr("9999999999").unwrap().is_some());
        drop(rx);

        assert_eq!(task.await.unwrap(), PairingPhase::Superseded);
        let status = registry.status("9999999999").unwrap();
        assert!(!status.pairing_in_progress);
        assert!(!registry.session("9999999999").unwrap().client().is_connected());
    }
}

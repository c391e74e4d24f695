#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    secrecy::Secret,
    serde_json::{Value, json},
    tokio::task::JoinHandle,
    wagate_channels::{ClientFactory, DeviceStore},
    wagate_config::WagateConfig,
    wagate_gateway::{GatewayState, build_app},
    wagate_sessions::SqliteSessionMetadata,
    wagate_whatsapp::{LoopbackClient, LoopbackFactory, LoopbackOptions, MemoryDeviceStore},
};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "correct horse battery staple";

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<GatewayState>,
    pub factory: Arc<LoopbackFactory>,
    pub http: reqwest::Client,
    server: JoinHandle<()>,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self.server.abort();
    }
}

pub fn test_config() -> WagateConfig {
    let mut config = WagateConfig::default();
    config.auth.password = Some(Secret::new(PASSWORD.into()));
    config.auth.jwt_secret = Some(Secret::new("integration-test-secret".into()));
    config.auth.login_delay_ms = 0;
    config.auth.trust_proxy = true;
    config.pairing.timeout_secs = 10;
    config.sessions.logout_timeout_secs = 1;
    config
}

pub fn fast_pairing() -> LoopbackOptions {
    LoopbackOptions {
        code_count: 2,
        code_interval: Duration::from_millis(20),
        code_timeout: Duration::from_secs(20),
        auto_pair: true,
        phone_prefix: "62".into(),
        connect_delay: Duration::ZERO,
    }
}

/// Boot a gateway on an ephemeral port with in-memory storage.
pub async fn spawn_gateway(config: WagateConfig, options: LoopbackOptions) -> TestGateway {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    SqliteSessionMetadata::init(&pool).await.unwrap();
    let metadata = SqliteSessionMetadata::new(pool);

    let store: Arc<dyn DeviceStore> = Arc::new(MemoryDeviceStore::new());
    let factory = Arc::new(LoopbackFactory::new(store, options));
    let state = GatewayState::new(
        config,
        Arc::clone(&factory) as Arc<dyn ClientFactory>,
        metadata,
    )
    .unwrap();

    let app = build_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestGateway {
        addr,
        state,
        factory,
        http: reqwest::Client::new(),
        server,
    }
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self, id: &str, token: &str) -> String {
        format!("ws://{}/ws/{id}?token={token}", self.addr)
    }

    pub async fn token(&self) -> String {
        let body: Value = self
            .http
            .post(self.url("/login"))
            .json(&json!({ "username": USERNAME, "password": PASSWORD }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["success"], true, "login failed: {body}");
        body["data"]["token"].as_str().unwrap().to_string()
    }

    pub async fn create_session(&self, token: &str, body: Value) -> Value {
        let resp = self
            .http
            .post(self.url("/sessions"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    pub async fn get_session(&self, token: &str, id: &str) -> reqwest::Response {
        self.http
            .get(self.url(&format!("/sessions/{id}")))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    pub fn client(&self, id: &str) -> LoopbackClient {
        let session = self.state.registry.session(id).unwrap();
        self.factory.client(session.device_id()).unwrap()
    }
}

use std::{sync::Arc, time::Instant};

use {
    tokio_util::sync::CancellationToken,
    wagate_channels::ClientFactory,
    wagate_config::WagateConfig,
    wagate_sessions::SqliteSessionMetadata,
};

use crate::{
    auth::{Credentials, TokenSigner},
    rate_limit::LoginRateLimiter,
    registry::SessionRegistry,
    webhook::WebhookDispatcher,
};

/// Shared state handed to every handler.
pub struct GatewayState {
    pub config: WagateConfig,
    pub registry: SessionRegistry,
    pub limiter: Arc<LoginRateLimiter>,
    pub signer: TokenSigner,
    pub credentials: Credentials,
    pub version: String,
    pub hostname: String,
    pub started_at: Instant,
    /// Cancelled on shutdown; background tasks watch it.
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(
        config: WagateConfig,
        factory: Arc<dyn ClientFactory>,
        metadata: SqliteSessionMetadata,
    ) -> anyhow::Result<Arc<Self>> {
        let webhooks = WebhookDispatcher::new(&config.webhook)?;
        let registry = SessionRegistry::new(factory, metadata, webhooks, config.sessions.clone());
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        Ok(Arc::new(Self {
            limiter: Arc::new(LoginRateLimiter::new(&config.rate_limit)),
            signer: TokenSigner::from_config(&config.auth),
            credentials: Credentials::from_config(&config.auth),
            registry,
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    /// Start the login-attempt sweeper.
    pub fn spawn_background(&self) {
        Arc::clone(&self.limiter).spawn_sweeper(
            self.config.rate_limit.sweep_interval(),
            self.shutdown.child_token(),
        );
    }
}

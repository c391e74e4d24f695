//! Config schema: server, auth, login rate limiting, webhooks, pairing,
//! session lifecycle, storage.

use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagateConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub webhook: WebhookConfig,
    pub pairing: PairingConfig,
    pub sessions: SessionsConfig,
    pub database: DatabaseConfig,
    pub devices: DevicesConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Allow any origin. Off by default; the pairing page is usually served
    /// from the same origin.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
            cors: false,
        }
    }
}

/// Control-plane credentials and token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    /// Plain password or an argon2 PHC string (`$argon2id$...`).
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<Secret<String>>,
    /// HMAC key for signing access tokens.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub jwt_secret: Option<Secret<String>>,
    pub token_ttl_secs: u64,
    /// Minimum delay applied to every login before credentials are compared.
    pub login_delay_ms: u64,
    /// Take the client address from `X-Forwarded-For` (behind a reverse proxy).
    pub trust_proxy: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: None,
            jwt_secret: None,
            token_ttl_secs: 24 * 60 * 60,
            login_delay_ms: 500,
            trust_proxy: false,
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn login_delay(&self) -> Duration {
        Duration::from_millis(self.login_delay_ms)
    }
}

/// Login brute-force guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Failed attempts inside one window before the address is blocked.
    pub max_attempts: u32,
    pub window_secs: u64,
    pub block_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_secs: 15 * 60,
            block_secs: 15 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Outbound webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: concat!("wagate-webhook/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Upper bound on a single pairing attempt, on top of the protocol's own
    /// code timeouts.
    pub timeout_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { timeout_secs: 180 }
    }
}

impl PairingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Bound on the best-effort logout performed when a session is deleted.
    pub logout_timeout_secs: u64,
    /// Capacity of each session's protocol event queue.
    pub event_buffer: usize,
    /// Reconnect previously paired sessions at startup.
    pub reconnect_on_start: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            logout_timeout_secs: 5,
            event_buffer: 256,
            reconnect_on_start: true,
        }
    }
}

impl SessionsConfig {
    pub fn logout_timeout(&self) -> Duration {
        Duration::from_secs(self.logout_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file for session metadata. Defaults to `<data_dir>/wagate.db`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Device identity store. Defaults to `<data_dir>/devices`.
    pub path: Option<PathBuf>,
    pub loopback: LoopbackConfig,
}

/// Tuning for the in-process loopback protocol client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Pairing codes issued before the attempt resolves.
    pub code_count: u32,
    pub code_interval_ms: u64,
    pub code_timeout_secs: u64,
    /// Complete pairing after the last code; otherwise time out.
    pub auto_pair: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            code_count: 2,
            code_interval_ms: 2_000,
            code_timeout_secs: 20,
            auto_pair: true,
        }
    }
}

fn serialize_option_secret<S: Serializer>(
    value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WagateConfig::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.rate_limit.max_attempts, 5);
        assert_eq!(cfg.rate_limit.window(), Duration::from_secs(900));
        assert_eq!(cfg.sessions.logout_timeout(), Duration::from_secs(5));
        assert!(cfg.sessions.reconnect_on_start);
        assert!(cfg.auth.password.is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: WagateConfig = toml::from_str(
            r#"
            [auth]
            password = "s3cret"

            [rate_limit]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.rate_limit.max_attempts, 3);
        assert_eq!(cfg.rate_limit.block_secs, 900);
        assert_eq!(cfg.auth.username, "admin");
        assert_eq!(
            cfg.auth.password.as_ref().map(|p| p.expose_secret().as_str()),
            Some("s3cret")
        );
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut cfg = AuthConfig::default();
        cfg.password = Some(Secret::new("very-private".into()));
        let out = format!("{cfg:?}");
        assert!(!out.contains("very-private"));
    }

    #[test]
    fn sweep_interval_never_zero() {
        let cfg = RateLimitConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
    }
}

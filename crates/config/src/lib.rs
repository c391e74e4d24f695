//! Configuration for the wagate gateway.
//!
//! Config is read from `wagate.{toml,yaml,yml,json}` with `${ENV}` placeholder
//! substitution, then selected secrets are overridden from the environment.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir,
    },
    schema::{
        AuthConfig, DatabaseConfig, DevicesConfig, LoopbackConfig, PairingConfig,
        RateLimitConfig, ServerConfig, SessionsConfig, WagateConfig, WebhookConfig,
    },
};

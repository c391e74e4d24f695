//! Device identity storage and the in-process loopback protocol client.
//!
//! Identities are kept in a sled tree (postcard-encoded) so paired sessions
//! survive restarts. [`LoopbackFactory`] drives the full pairing/connection
//! lifecycle without a network, for local development and tests.

pub mod error;
pub mod loopback;
pub mod store;

pub use {
    error::DeviceStoreError,
    loopback::{LoopbackClient, LoopbackFactory, LoopbackOptions},
    store::{MemoryDeviceStore, SledDeviceStore},
};

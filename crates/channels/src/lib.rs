//! Protocol-client boundary.
//!
//! The messaging-network client (pairing cryptography, transport, message
//! codec) lives outside this workspace. This crate pins down the surface the
//! gateway consumes: the [`ProtocolClient`] trait, the events it emits, the
//! device identities it persists, and the inbound message model.

pub mod device;
pub mod jid;
pub mod message;
pub mod plugin;

pub use {
    device::{DeviceIdentity, DeviceStore},
    message::{InboundMessage, MessagePayload},
    plugin::{ClientEvent, ClientFactory, EventHandler, PairingEvent, ProtocolClient},
};

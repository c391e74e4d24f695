//! Inbound message model.
//!
//! Mirrors the protocol's layout: a message carries at most one populated
//! sub-message. Media entries hold a remote reference and descriptors only,
//! never payload bytes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Unix seconds, as stamped by the network.
    pub timestamp: i64,
    /// Chat JID: the peer for direct chats, the group for group chats.
    pub chat: String,
    pub sender: String,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePayload {
    pub conversation: Option<String>,
    pub extended_text: Option<ExtendedText>,
    pub image: Option<MediaMessage>,
    pub video: Option<MediaMessage>,
    pub audio: Option<MediaMessage>,
    pub document: Option<MediaMessage>,
    pub sticker: Option<MediaMessage>,
    pub location: Option<LocationMessage>,
    pub contact: Option<ContactMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedText {
    pub text: String,
    #[serde(default)]
    pub matched_text: Option<String>,
}

/// Descriptor for any downloadable attachment. Type-specific fields are
/// `None` where they don't apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaMessage {
    pub url: String,
    pub direct_path: Option<String>,
    pub mimetype: String,
    pub file_length: u64,
    pub caption: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Duration for audio and video.
    pub seconds: Option<u32>,
    /// Voice note.
    pub ptt: bool,
    pub file_name: Option<String>,
    pub title: Option<String>,
    pub page_count: Option<u32>,
    pub is_animated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationMessage {
    pub degrees_latitude: f64,
    pub degrees_longitude: f64,
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactMessage {
    pub display_name: String,
    pub vcard: String,
}

impl InboundMessage {
    /// A plain text message from `sender` in a direct chat.
    pub fn text(id: impl Into<String>, sender: impl Into<String>, body: impl Into<String>) -> Self {
        let sender = sender.into();
        Self {
            id: id.into(),
            chat: sender.clone(),
            sender,
            payload: MessagePayload {
                conversation: Some(body.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

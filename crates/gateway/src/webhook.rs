//! Outbound delivery of inbound messages to a session's callback URL.
//!
//! Each message is classified, projected into a [`WebhookPayload`] and POSTed
//! once from its own task. Failures are logged and never retried.

use std::fmt;

use {
    anyhow::Context,
    reqwest::StatusCode,
    serde::Serialize,
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
    wagate_channels::{
        InboundMessage,
        jid,
        message::{ContactMessage, LocationMessage, MediaMessage},
    },
    wagate_config::WebhookConfig,
    wagate_sessions::metadata::now_secs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    Unknown,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub session_id: String,
    pub timestamp: i64,
    pub message_id: String,
    pub from: Sender,
    pub message_type: MessageType,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<ContactInfo>,
    pub is_from_me: bool,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sender {
    pub jid: String,
    pub phone: String,
    pub push_name: String,
}

/// Attachment descriptor. The payload bytes are never fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub url: String,
    pub mime_type: String,
    pub file_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ptt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_animated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationInfo {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactInfo {
    pub display_name: String,
    pub vcard: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupInfo {
    pub jid: String,
    pub name: String,
}

impl From<&MediaMessage> for MediaInfo {
    fn from(m: &MediaMessage) -> Self {
        Self {
            url: m.url.clone(),
            mime_type: m.mimetype.clone(),
            file_length: m.file_length,
            direct_path: m.direct_path.clone(),
            caption: m.caption.clone(),
            width: m.width,
            height: m.height,
            seconds: m.seconds,
            ptt: m.ptt,
            file_name: m.file_name.clone(),
            title: m.title.clone(),
            page_count: m.page_count,
            is_animated: m.is_animated,
        }
    }
}

impl From<&LocationMessage> for LocationInfo {
    fn from(l: &LocationMessage) -> Self {
        Self {
            latitude: l.degrees_latitude,
            longitude: l.degrees_longitude,
            name: l.name.clone(),
            address: l.address.clone(),
        }
    }
}

impl From<&ContactMessage> for ContactInfo {
    fn from(c: &ContactMessage) -> Self {
        Self {
            display_name: c.display_name.clone(),
            vcard: c.vcard.clone(),
        }
    }
}

/// Kind, content summary and typed extras of one message.
struct Classified {
    kind: MessageType,
    content: String,
    media: Option<MediaInfo>,
    location: Option<LocationInfo>,
    contact: Option<ContactInfo>,
}

impl Classified {
    fn new(kind: MessageType, content: String) -> Self {
        Self {
            kind,
            content,
            media: None,
            location: None,
            contact: None,
        }
    }

    fn media(kind: MessageType, media: &MediaMessage, content: Option<&str>) -> Self {
        Self {
            media: Some(media.into()),
            ..Self::new(kind, content.unwrap_or_default().to_string())
        }
    }
}

fn classify(msg: &InboundMessage) -> Classified {
    let p = &msg.payload;
    if let Some(text) = &p.conversation {
        return Classified::new(MessageType::Text, text.clone());
    }
    if let Some(ext) = &p.extended_text {
        return Classified::new(MessageType::Text, ext.text.clone());
    }
    if let Some(m) = &p.image {
        return Classified::media(MessageType::Image, m, m.caption.as_deref());
    }
    if let Some(m) = &p.video {
        return Classified::media(MessageType::Video, m, m.caption.as_deref());
    }
    if let Some(m) = &p.audio {
        return Classified::media(MessageType::Audio, m, None);
    }
    if let Some(m) = &p.document {
        let content = m.caption.as_deref().or(m.file_name.as_deref());
        return Classified::media(MessageType::Document, m, content);
    }
    if let Some(m) = &p.sticker {
        return Classified::media(MessageType::Sticker, m, None);
    }
    if let Some(loc) = &p.location {
        let content = format!("{},{}", loc.degrees_latitude, loc.degrees_longitude);
        return Classified {
            location: Some(loc.into()),
            ..Classified::new(MessageType::Location, content)
        };
    }
    if let Some(contact) = &p.contact {
        return Classified {
            contact: Some(contact.into()),
            ..Classified::new(MessageType::Contact, contact.display_name.clone())
        };
    }
    Classified::new(MessageType::Unknown, String::new())
}

impl WebhookPayload {
    pub fn from_message(session_id: &str, msg: &InboundMessage) -> Self {
        let Classified {
            kind,
            content,
            media,
            location,
            contact,
        } = classify(msg);

        let is_group = msg.is_group || jid::is_group(&msg.chat);
        Self {
            session_id: session_id.to_string(),
            timestamp: if msg.timestamp > 0 {
                msg.timestamp
            } else {
                now_secs()
            },
            message_id: msg.id.clone(),
            from: Sender {
                jid: msg.sender.clone(),
                phone: jid::user_of(&msg.sender).to_string(),
                push_name: msg.push_name.clone(),
            },
            message_type: kind,
            content,
            media,
            location,
            contact,
            is_from_me: msg.is_from_me,
            is_group,
            group: is_group.then(|| GroupInfo {
                jid: msg.chat.clone(),
                name: String::new(),
            }),
        }
    }
}

/// Fire-and-forget webhook sender. Cloning shares the HTTP connection pool.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .context("build webhook http client")?;
        Ok(Self { client })
    }

    /// Deliver `msg` to `webhook_url` on a new task. Returns `None` without
    /// doing anything when the URL is empty.
    pub fn dispatch(
        &self,
        session_id: &str,
        webhook_url: &str,
        msg: &InboundMessage,
    ) -> Option<JoinHandle<()>> {
        let url = webhook_url.trim();
        if url.is_empty() {
            debug!(session_id, message_id = %msg.id, "no webhook configured, skipping");
            return None;
        }

        let payload = WebhookPayload::from_message(session_id, msg);
        let url = url.to_string();
        let this = self.clone();
        Some(tokio::spawn(async move {
            match this.deliver(&url, &payload).await {
                Ok(status) if status.is_success() => info!(
                    session_id = %payload.session_id,
                    message_id = %payload.message_id,
                    message_type = %payload.message_type,
                    %status,
                    "webhook delivered"
                ),
                Ok(status) => warn!(
                    session_id = %payload.session_id,
                    message_id = %payload.message_id,
                    %status,
                    "webhook endpoint rejected delivery"
                ),
                Err(e) => warn!(
                    session_id = %payload.session_id,
                    message_id = %payload.message_id,
                    error = %format!("{e:#}"),
                    "webhook delivery failed"
                ),
            }
        }))
    }

    /// Single POST, no retry.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload) -> anyhow::Result<StatusCode> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        Ok(response.status())
    }
}

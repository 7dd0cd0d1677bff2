//! Canonical inbound/outbound message shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat_id::ChatId;
use crate::tier::Tier;

/// A single attachment referenced by an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Absolute path to the attachment on disk.
    pub path: String,
    /// MIME type if known.
    pub mime_type: Option<String>,
    /// Display filename, for prompt-wrapping (§4.4 "Message body
    /// formatting": attachments listed with name, mime, size, path).
    pub name: String,
    pub size_bytes: u64,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "tiff", "heic"];

impl Attachment {
    /// `true` when the path's extension is a known raster-image type,
    /// gating the vision pipeline (§4.4 "Vision pipeline") and the
    /// PreToolUse oversized-image hook (§4.2).
    pub fn is_image(&self) -> bool {
        std::path::Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

/// An immutable, fully-resolved inbound message, ready to be handed to the
/// orchestrator. Produced by the ingress multiplexer after backend-specific
/// parsing and identity/tier resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Canonical conversation key this message belongs to.
    pub chat_id: ChatId,
    /// Backend this message arrived over.
    pub source: String,
    /// Sender's bare identifier (phone number or participant id), already
    /// normalized.
    pub sender: String,
    /// Resolved trust tier of the sender.
    pub tier: Tier,
    /// Display name for the sender, if the contacts directory has one.
    pub display_name: Option<String>,
    /// Message body text. May be empty when the message is attachment-only.
    pub text: String,
    /// Attachments included with the message.
    pub attachments: Vec<Attachment>,
    /// `true` when this message was sent to a group chat.
    pub is_group: bool,
    /// Display name of the group chat, if known and `is_group`.
    pub group_name: Option<String>,
    /// Transcription of an attached audio clip, if any.
    pub audio_transcription: Option<String>,
    /// Backend-native guid of the message this one replies to, if any —
    /// drives reply-chain expansion (§4.4) via `ReplyChainReader`.
    pub reply_to_guid: Option<String>,
    /// Timestamp the message was received at.
    pub received_at: DateTime<Utc>,
    /// Backend-native message id, used for reply-chain lookups.
    pub native_id: Option<String>,
}

impl Message {
    /// A message is ingest-worthy only if it carries text or at least one
    /// attachment; an empty, attachment-less message is dropped at ingress
    /// and never reaches the orchestrator.
    pub fn is_empty_payload(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

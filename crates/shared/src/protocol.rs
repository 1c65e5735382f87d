use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AttachmentId, AttachmentKind, ConversationId, ConversationKind, MessageId, PersonKind,
    PresenceStatus, UserId,
};

/// Server responses come either wrapped as `{ "result": T }` or as the bare
/// payload, depending on the endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResultEnvelope<T> {
    Wrapped { result: T },
    Flat(T),
}

impl<T> ResultEnvelope<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Wrapped { result } => result,
            Self::Flat(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRef {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoPayload {
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPayload {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<PersonKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<PhotoPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    #[serde(rename = "_id")]
    pub id: AttachmentId,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub emotion: String,
    #[serde(default)]
    pub users: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionPayload {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    #[serde(rename = "_id")]
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyboardPayload {
    #[serde(default)]
    pub one_time: bool,
    #[serde(default)]
    pub hide: bool,
    #[serde(default)]
    pub buttons: Vec<KeyboardButton>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub room_id: ConversationId,
    pub sender: PersonRef,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message: Option<Box<MessagePayload>>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub edited: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<bool>,
    #[serde(default)]
    pub emotions: Vec<ReactionPayload>,
    #[serde(default)]
    pub mentions: Vec<MentionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<KeyboardPayload>,
    #[serde(default)]
    pub urls: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastAttachmentKind {
    File,
    Photo,
    Video,
    Sticker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub sender: PersonRef,
    #[serde(default)]
    pub attachment_type: Option<LastAttachmentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message: Option<Box<LastMessagePayload>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub sound: bool,
    #[serde(default = "default_true")]
    pub vibration: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sound: true,
            vibration: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPayload {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub members: Vec<MemberPayload>,
    #[serde(default)]
    pub settings: ConversationSettings,
    #[serde(default)]
    pub unread: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessagePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<PhotoPayload>,
    #[serde(default)]
    pub link_invite: bool,
    #[serde(default)]
    pub bot_chat: bool,
    #[serde(default)]
    pub is_owner: bool,
}

// ---- request bodies ----

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub room_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<AttachmentId>>,
    /// Reply target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message_ids: Option<Vec<MessageId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageBody {
    pub message_id: MessageId,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRefBody {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessagesBody {
    pub room_id: ConversationId,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveBody {
    pub room_id: ConversationId,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRefBody {
    pub room_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsBody {
    pub room_id: ConversationId,
    pub notifications: NotificationToggle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NotificationToggle {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionBody {
    pub message_id: MessageId,
    pub emotion_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDialogBody {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatBody {
    pub name: String,
    pub user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_attachment: Option<AttachmentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRefBody {
    pub room_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteBody {
    pub room_id: ConversationId,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomBody {
    pub room_id: ConversationId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_attachment: Option<AttachmentId>,
}

// ---- responses ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    pub room_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurroundingPage {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
    #[serde(default)]
    pub more_before: bool,
    #[serde(default)]
    pub more_after: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousPage {
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_not_loaded: u32,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextPage {
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersPage {
    #[serde(default)]
    pub owners: Vec<UserId>,
    #[serde(default)]
    pub data: Vec<MemberPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub data: AttachmentPayload,
}

/// Quoted original inside a search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundForward {
    pub sender: PersonRef,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub room_id: ConversationId,
    pub sender: PersonRef,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_message: Option<FoundForward>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchMeta {
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub data: Vec<FoundMessage>,
    #[serde(default)]
    pub meta: SearchMeta,
}

// ---- push events ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRefPayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PersonRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotionEventPayload {
    pub user: UserId,
    pub emotion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authorized,
    NotifyRoom {
        room_id: ConversationId,
        message: MessagePayload,
    },
    NotifyMessageRead {
        room_id: ConversationId,
        user: PersonRef,
        last_seen: DateTime<Utc>,
    },
    NotifyMessageEdit {
        room_id: ConversationId,
        message: MessagePayload,
    },
    NotifyMessageDelete {
        room_id: ConversationId,
        message: MessageRefPayload,
    },
    NotifyMessageEmotion {
        room_id: ConversationId,
        message: MessageRefPayload,
        emotion: EmotionEventPayload,
    },
}

impl ServerEvent {
    pub fn room_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Authorized => None,
            Self::NotifyRoom { room_id, .. }
            | Self::NotifyMessageRead { room_id, .. }
            | Self::NotifyMessageEdit { room_id, .. }
            | Self::NotifyMessageDelete { room_id, .. }
            | Self::NotifyMessageEmotion { room_id, .. } => Some(room_id),
        }
    }
}

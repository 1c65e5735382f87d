use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{AttachmentKind, ConversationId, MessageId, UserId},
    protocol::{
        AttachmentPayload, KeyboardPayload, LastAttachmentKind, LastMessagePayload,
        MentionPayload, MessagePayload, MessageType, PersonRef, ReactionPayload,
    },
};
use uuid::Uuid;

use crate::upload::UploadRequest;

/// Stable client-side handle for a message. Unlike [`MessageId`] it never
/// changes when the server confirms the message, and it never leaves the
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalKey(Uuid);

impl LocalKey {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Default,
    /// Carries nothing but a forwarded message.
    Forward,
}

/// What a system message announces about its conversation. The server only
/// tells us through the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Pinned,
    Unpinned,
    MembersChanged,
    Renamed,
}

const SYSTEM_MARKERS: [(&str, SystemEvent); 5] = [
    ("закрепил новое сообщение", SystemEvent::Pinned),
    ("открепил сообщение", SystemEvent::Unpinned),
    ("удалил пользователя", SystemEvent::MembersChanged),
    ("добавил пользователя", SystemEvent::MembersChanged),
    ("изменил название группы", SystemEvent::Renamed),
];

/// Users who reacted to a message with one emotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emotion: String,
    users: Vec<UserId>,
}

impl Reaction {
    pub fn new(emotion: impl Into<String>, users: Vec<UserId>) -> Self {
        let mut deduped: Vec<UserId> = Vec::with_capacity(users.len());
        for user in users {
            if !deduped.contains(&user) {
                deduped.push(user);
            }
        }
        Self {
            emotion: emotion.into(),
            users: deduped,
        }
    }

    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    pub fn has(&self, user: &UserId) -> bool {
        self.users.contains(user)
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn remove(&mut self, user: &UserId) {
        self.users.retain(|existing| existing != user);
    }

    fn toggle(&mut self, user: &UserId) {
        if self.has(user) {
            self.remove(user);
        } else {
            self.users.push(user.clone());
        }
    }

    pub fn to_payload(&self) -> ReactionPayload {
        ReactionPayload {
            emotion: self.emotion.clone(),
            users: self.users.clone(),
        }
    }
}

/// File transfers owned by a message until they resolve.
#[derive(Clone, Default)]
pub struct PendingUploads(Vec<Arc<dyn UploadRequest>>);

impl PendingUploads {
    pub fn new(requests: Vec<Arc<dyn UploadRequest>>) -> Self {
        Self(requests)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn requests(&self) -> &[Arc<dyn UploadRequest>] {
        &self.0
    }

    pub fn abort_all(&self) {
        for request in &self.0 {
            request.abort();
        }
    }
}

impl fmt::Debug for PendingUploads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|request| request.filename().to_string()))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    local_key: LocalKey,
    pub room_id: ConversationId,
    pub sender: PersonRef,
    pub body: String,
    pub attachments: Vec<AttachmentPayload>,
    pub forwarded: Option<Box<Message>>,
    pub message_type: Option<MessageType>,
    pub deleted: bool,
    pub edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub unread: bool,
    pub mentions: Vec<MentionPayload>,
    pub keyboard: Option<KeyboardPayload>,
    pub urls: Vec<serde_json::Value>,
    reactions: Vec<Reaction>,
    sending: bool,
    error: Option<Arc<anyhow::Error>>,
    uploads: PendingUploads,
    is_loading: bool,
}

impl Message {
    pub fn from_payload(payload: MessagePayload) -> Self {
        let mut message = Self {
            id: payload.id.clone(),
            local_key: LocalKey::new(),
            room_id: payload.room_id.clone(),
            sender: payload.sender.clone(),
            body: String::new(),
            attachments: Vec::new(),
            forwarded: None,
            message_type: None,
            deleted: false,
            edited: false,
            created_at: payload.created_at,
            updated_at: None,
            edited_at: None,
            unread: false,
            mentions: Vec::new(),
            keyboard: None,
            urls: Vec::new(),
            reactions: Vec::new(),
            sending: false,
            error: None,
            uploads: PendingUploads::default(),
            is_loading: false,
        };
        message.update(payload);
        message
    }

    pub fn list_from(payloads: Vec<MessagePayload>) -> Vec<Self> {
        payloads.into_iter().map(Self::from_payload).collect()
    }

    /// Optimistic draft authored locally; its id is a placeholder until the
    /// server assigns one.
    pub fn draft(sender: PersonRef, room_id: ConversationId, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::local(),
            local_key: LocalKey::new(),
            room_id,
            sender,
            body: body.into(),
            attachments: Vec::new(),
            forwarded: None,
            message_type: None,
            deleted: false,
            edited: false,
            created_at: now,
            updated_at: Some(now),
            edited_at: None,
            unread: true,
            mentions: Vec::new(),
            keyboard: Some(KeyboardPayload::default()),
            urls: Vec::new(),
            reactions: Vec::new(),
            sending: false,
            error: None,
            uploads: PendingUploads::default(),
            is_loading: false,
        }
    }

    /// Replaces server-owned fields; local send state is kept.
    pub fn update(&mut self, payload: MessagePayload) {
        self.id = payload.id;
        self.room_id = payload.room_id;
        self.sender = payload.sender;
        self.body = payload.body;
        self.attachments = payload.attachments;
        self.forwarded = payload
            .forwarded_message
            .map(|forwarded| Box::new(Self::from_payload(*forwarded)));
        self.message_type = payload.message_type;
        self.deleted = payload.deleted;
        self.edited = payload.edited;
        self.created_at = payload.created_at;
        self.updated_at = payload.updated_at;
        self.edited_at = payload.edited_at;
        self.unread = payload.unread.unwrap_or(false);
        self.mentions = payload.mentions;
        self.keyboard = payload.keyboard;
        self.urls = payload.urls;
        self.reactions = payload
            .emotions
            .into_iter()
            .map(|reaction| Reaction::new(reaction.emotion, reaction.users))
            .filter(|reaction| !reaction.is_empty())
            .collect();
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn system_event(&self) -> Option<SystemEvent> {
        if !self.is_system() {
            return None;
        }
        SYSTEM_MARKERS
            .iter()
            .find(|(marker, _)| self.body.contains(marker))
            .map(|(_, event)| *event)
    }

    pub fn local_key(&self) -> LocalKey {
        self.local_key
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_forward(mut self, forwarded: Option<Message>) -> Self {
        self.forwarded = forwarded.map(Box::new);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentPayload>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_uploads(mut self, uploads: Vec<Arc<dyn UploadRequest>>) -> Self {
        self.uploads = PendingUploads::new(uploads);
        self
    }

    pub fn timestamp(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    pub fn is_system(&self) -> bool {
        self.message_type == Some(MessageType::System)
    }

    pub fn layout(&self) -> Layout {
        if self.forwarded.is_some() && self.body.is_empty() && self.attachments.is_empty() {
            Layout::Forward
        } else {
            Layout::Default
        }
    }

    /// The content to re-send when this message is forwarded elsewhere.
    pub fn as_forward(&self) -> Message {
        if self.layout() == Layout::Forward {
            if let Some(forwarded) = &self.forwarded {
                return (**forwarded).clone();
            }
        }
        let mut copy = self.clone();
        copy.forwarded = None;
        copy.uploads = PendingUploads::default();
        copy
    }

    // ---- send state ----

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn error(&self) -> Option<&Arc<anyhow::Error>> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Confirmed by the server and not waiting on anything.
    pub fn is_settled(&self) -> bool {
        !self.sending && self.error.is_none()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn uploads(&self) -> &PendingUploads {
        &self.uploads
    }

    pub fn mark_sending(&mut self, sending: bool) {
        self.sending = sending;
    }

    pub fn mark_error(&mut self, error: Arc<anyhow::Error>) {
        self.error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Server confirmation: adopt the assigned id and leave the pending
    /// states. Chain position is untouched.
    pub fn confirm(&mut self, id: MessageId) {
        self.id = id;
        self.sending = false;
        self.error = None;
    }

    /// Hands out the pending transfers for a sequential run and flags the
    /// message as loading. Returns an empty list when nothing is pending.
    pub fn begin_uploads(&mut self) -> Vec<Arc<dyn UploadRequest>> {
        if self.uploads.is_empty() {
            return Vec::new();
        }
        self.is_loading = true;
        self.uploads.requests().to_vec()
    }

    pub fn finish_uploads(&mut self, attachments: Vec<AttachmentPayload>) {
        self.uploads = PendingUploads::default();
        self.attachments = attachments;
        self.is_loading = false;
    }

    /// Any failed transfer fails the whole message; descriptors of transfers
    /// that did complete are dropped with it.
    pub fn fail_uploads(&mut self, error: Arc<anyhow::Error>) {
        self.is_loading = false;
        self.error = Some(error);
    }

    pub fn stop_uploads(&mut self) {
        self.uploads.abort_all();
        self.is_loading = false;
    }

    // ---- server-driven mutations ----

    pub fn set_deleted(&mut self) {
        self.deleted = true;
        self.body.clear();
    }

    pub fn set_read(&mut self) {
        self.unread = false;
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    /// A user holds at most one emotion per message. Toggling the held
    /// emotion removes it; toggling another one moves the user there.
    pub fn toggle_reaction(&mut self, user: &UserId, emotion: &str) {
        let current = self.reactions.iter().position(|reaction| reaction.has(user));
        let target = self
            .reactions
            .iter()
            .position(|reaction| reaction.emotion == emotion);

        match (current, target) {
            (Some(current), Some(target)) if current == target => {
                self.reactions[target].remove(user);
            }
            (current, target) => {
                if let Some(current) = current {
                    self.reactions[current].remove(user);
                }
                match target {
                    Some(target) => self.reactions[target].toggle(user),
                    None => self
                        .reactions
                        .push(Reaction::new(emotion, vec![user.clone()])),
                }
            }
        }
        self.reactions.retain(|reaction| !reaction.is_empty());
    }

    // ---- reconciliation ----

    pub fn same_body(&self, other: &Message) -> bool {
        self.body == other.body
    }

    pub fn same_attachment_count(&self, other: &Message) -> bool {
        self.attachments.len() == other.attachments.len()
    }

    pub fn same_sender(&self, other: &Message) -> bool {
        self.sender.id == other.sender.id
    }

    pub fn same_forwarded(&self, other: &Message) -> bool {
        self.forwarded.as_ref().map(|m| m.id()) == other.forwarded.as_ref().map(|m| m.id())
    }

    /// Whether `incoming` looks like the server's copy of this pending
    /// optimistic message.
    pub fn is_pending_match(&self, incoming: &Message) -> bool {
        if !self.sending {
            return false;
        }
        match incoming.layout() {
            Layout::Forward => self.same_forwarded(incoming),
            Layout::Default => {
                self.same_body(incoming)
                    && self.same_attachment_count(incoming)
                    && self.same_sender(incoming)
            }
        }
    }

    // ---- summaries ----

    pub fn last_message_summary(&self) -> LastMessagePayload {
        let attachment_type = self
            .attachments
            .first()
            .and_then(|attachment| match attachment.kind {
                AttachmentKind::Image => Some(LastAttachmentKind::Photo),
                AttachmentKind::File => Some(LastAttachmentKind::File),
                AttachmentKind::Video => Some(LastAttachmentKind::Video),
                AttachmentKind::Audio | AttachmentKind::Sticker => None,
            });
        LastMessagePayload {
            id: self.id.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
            sender: self.sender.clone(),
            attachment_type,
            forwarded_message: self
                .forwarded
                .as_ref()
                .map(|forwarded| Box::new(forwarded.last_message_summary())),
        }
    }

    pub fn to_payload(&self) -> MessagePayload {
        MessagePayload {
            id: self.id.clone(),
            room_id: self.room_id.clone(),
            sender: self.sender.clone(),
            body: self.body.clone(),
            attachments: self.attachments.clone(),
            forwarded_message: self
                .forwarded
                .as_ref()
                .map(|forwarded| Box::new(forwarded.to_payload())),
            message_type: self.message_type,
            deleted: self.deleted,
            edited: self.edited,
            created_at: self.created_at,
            updated_at: self.updated_at,
            edited_at: self.edited_at,
            unread: Some(self.unread),
            emotions: self.reactions.iter().map(Reaction::to_payload).collect(),
            mentions: self.mentions.clone(),
            keyboard: self.keyboard.clone(),
            urls: self.urls.clone(),
        }
    }
}

#[cfg(test)]
#[path = "tests/message_tests.rs"]
mod tests;

use std::collections::HashSet;

use chrono::Utc;
use shared::{
    domain::{ConversationId, ConversationKind, UserId},
    protocol::{
        ConversationPayload, ConversationSettings, LastMessagePayload, MemberPayload, PersonRef,
    },
};

use crate::{chat_messages::ChatMessages, config::PaginationLimits, message::Message};

/// Id of the stand-in self conversation shown before the server has one.
pub const SAVED_PLACEHOLDER_ID: &str = "fake_saved";

/// The signed-in account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
}

impl CurrentUser {
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }

    pub fn person(&self) -> PersonRef {
        PersonRef {
            id: self.id.clone(),
            username: self.username.clone(),
        }
    }

    fn member(&self) -> MemberPayload {
        MemberPayload {
            id: self.id.clone(),
            username: self.username.clone(),
            first_name: String::new(),
            last_name: String::new(),
            kind: None,
            status: None,
            photo: None,
        }
    }
}

#[derive(Debug)]
pub struct Conversation {
    pub info: ConversationPayload,
    pub messages: ChatMessages,
    pub pinned: Option<Message>,
    pub owners: HashSet<UserId>,
    self_id: UserId,
    resend_in_flight: bool,
}

impl Conversation {
    pub fn new(info: ConversationPayload, self_id: UserId, limits: PaginationLimits) -> Self {
        Self {
            messages: ChatMessages::new(info.id.clone(), self_id.clone(), limits),
            info,
            pinned: None,
            owners: HashSet::new(),
            self_id,
            resend_in_flight: false,
        }
    }

    /// Self dialog placeholder listing the user twice as its members.
    pub fn saved_placeholder(user: &CurrentUser, limits: PaginationLimits) -> Self {
        let now = Utc::now();
        let info = ConversationPayload {
            id: ConversationId::new(SAVED_PLACEHOLDER_ID),
            kind: ConversationKind::Dialog,
            created_at: now,
            updated_at: Some(now),
            last_seen: Some(now),
            members: vec![user.member(), user.member()],
            settings: ConversationSettings::default(),
            unread: 0,
            name: None,
            last_message: None,
            photo: None,
            link_invite: false,
            bot_chat: false,
            is_owner: false,
        };
        Self::new(info, user.id.clone(), limits)
    }

    pub fn id(&self) -> &ConversationId {
        &self.info.id
    }

    pub fn kind(&self) -> ConversationKind {
        self.info.kind
    }

    /// The other participant of a dialog.
    pub fn member(&self) -> Option<&MemberPayload> {
        if self.info.kind != ConversationKind::Dialog {
            return None;
        }
        self.info
            .members
            .iter()
            .find(|member| member.id != self.self_id)
    }

    /// A dialog with nobody but the current user.
    pub fn is_saved(&self) -> bool {
        self.info.kind == ConversationKind::Dialog && self.member().is_none()
    }

    pub fn is_placeholder(&self) -> bool {
        self.info.id.as_str() == SAVED_PLACEHOLDER_ID
    }

    pub fn title(&self) -> String {
        match self.info.kind {
            ConversationKind::Dialog => match self.member() {
                Some(member) if !member.first_name.is_empty() || !member.last_name.is_empty() => {
                    format!("{} {}", member.first_name, member.last_name)
                        .trim()
                        .to_string()
                }
                Some(member) => member.username.clone(),
                None => "Saved messages".to_string(),
            },
            ConversationKind::Chat => self.info.name.clone().unwrap_or_default(),
        }
    }

    pub fn is_muted(&self) -> bool {
        !self.info.settings.notifications.enabled
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.info.settings.notifications.enabled = !muted;
    }

    /// The self conversation never reports unread messages.
    pub fn unread(&self) -> u32 {
        if self.is_saved() {
            0
        } else {
            self.info.unread
        }
    }

    pub fn set_unread(&mut self, unread: u32) {
        self.info.unread = unread;
    }

    pub fn increment_unread(&mut self) {
        self.info.unread = self.info.unread.saturating_add(1);
    }

    pub fn has_last_message(&self) -> bool {
        self.info.last_message.is_some()
    }

    pub fn update_last_message(&mut self, message: &Message) {
        self.info.last_message = Some(message.last_message_summary());
    }

    pub fn update_last_seen(&mut self, last_seen: chrono::DateTime<Utc>) {
        self.info.last_seen = Some(last_seen);
    }

    /// Replaces server-owned conversation data; loaded messages stay.
    pub fn set_info(&mut self, info: ConversationPayload) {
        self.info = info;
    }

    pub fn set_members(&mut self, owners: Vec<UserId>, members: Vec<MemberPayload>) {
        self.owners = owners.into_iter().collect();
        self.info.members = members;
    }

    pub fn is_owner(&self, user: &UserId) -> bool {
        self.owners.contains(user)
    }

    /// Read receipt from `user` up to `last_seen`.
    pub fn read_from(&mut self, user: &UserId, last_seen: chrono::DateTime<Utc>) {
        self.update_last_seen(last_seen);
        if user == &self.self_id {
            self.info.unread = 0;
        } else {
            self.messages.mark_own_read();
        }
    }

    pub fn try_begin_resend(&mut self) -> bool {
        if self.resend_in_flight {
            return false;
        }
        self.resend_in_flight = true;
        true
    }

    pub fn finish_resend(&mut self) {
        self.resend_in_flight = false;
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.info.id.clone(),
            kind: self.info.kind,
            title: self.title(),
            unread: self.unread(),
            muted: self.is_muted(),
            is_saved: self.is_saved(),
            last_message: self.info.last_message.clone(),
            more_before: self.messages.more_before(),
            more_after: self.messages.more_after(),
            loaded_messages: self.messages.chain().len(),
        }
    }
}

/// Read-only view of a conversation for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub title: String,
    pub unread: u32,
    pub muted: bool,
    pub is_saved: bool,
    pub last_message: Option<LastMessagePayload>,
    pub more_before: bool,
    pub more_after: bool,
    pub loaded_messages: usize,
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;

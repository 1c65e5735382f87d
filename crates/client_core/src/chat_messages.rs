//! Pagination and reconciliation over one conversation's [`MessageChain`].
//!
//! Fetches are split in two halves so no lock is held across the network:
//! `begin_*` claims the direction and returns what to ask for, `apply_*` or
//! `fail_fetch` settles it. A direction that is already in flight is dropped.

use std::collections::HashSet;

use chrono::FixedOffset;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{KeyboardButton, MessagePayload, SurroundingPage},
};
use tracing::debug;

use crate::{
    chain::{LinkContext, LinkId, MessageChain, MessageView, Tri},
    config::PaginationLimits,
    message::{LocalKey, Message},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Surrounding,
    Previous,
    Next,
}

/// What the caller should fetch after a successful `begin_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub conversation_id: ConversationId,
    pub direction: FetchDirection,
    /// Anchor in epoch milliseconds.
    pub timestamp: i64,
    pub limit: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Loadings {
    pub get: bool,
    pub prev: bool,
    pub next: bool,
}

impl Loadings {
    fn flag(&mut self, direction: FetchDirection) -> &mut bool {
        match direction {
            FetchDirection::Surrounding => &mut self.get,
            FetchDirection::Previous => &mut self.prev,
            FetchDirection::Next => &mut self.next,
        }
    }
}

/// Outcome of handing a pushed message to [`ChatMessages::add_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Confirmed a pending optimistic node in place.
    Reconciled(LinkId),
    /// Already loaded under the same id.
    Duplicate(LinkId),
    Inserted(LinkId),
    /// The window does not reach the live edge; nothing was inserted.
    OutsideWindow,
}

/// Buttons offered under the conversation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveKeyboard {
    pub message_id: MessageId,
    pub buttons: Vec<KeyboardButton>,
}

#[derive(Debug)]
pub struct ChatMessages {
    conversation_id: ConversationId,
    chain: MessageChain,
    more_before: bool,
    more_after: bool,
    loadings: Loadings,
    /// First unseen message, kept by id so it survives chain rebuilds.
    divider: Option<MessageId>,
    self_id: UserId,
    limits: PaginationLimits,
}

impl ChatMessages {
    pub fn new(conversation_id: ConversationId, self_id: UserId, limits: PaginationLimits) -> Self {
        Self {
            conversation_id,
            self_id,
            chain: MessageChain::new(),
            more_before: false,
            more_after: false,
            loadings: Loadings::default(),
            divider: None,
            limits,
        }
    }

    pub fn chain(&self) -> &MessageChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut MessageChain {
        &mut self.chain
    }

    pub fn more_before(&self) -> bool {
        self.more_before
    }

    pub fn more_after(&self) -> bool {
        self.more_after
    }

    pub fn loadings(&self) -> Loadings {
        self.loadings
    }

    pub fn divider(&self) -> Option<&MessageId> {
        self.divider.as_ref()
    }

    pub fn divider_link(&self) -> Option<LinkId> {
        self.divider
            .as_ref()
            .and_then(|id| self.chain.find_by_message_id(id))
    }

    pub fn reset_divider(&mut self) {
        self.divider = None;
    }

    pub fn context(&self, offset: FixedOffset) -> LinkContext<'_> {
        LinkContext {
            self_id: &self.self_id,
            divider: self.divider_link(),
            offset,
        }
    }

    pub fn views(&self, offset: FixedOffset) -> Vec<MessageView> {
        self.chain.views(&self.context(offset))
    }

    // ---- fetch lifecycle ----

    fn claim(&mut self, direction: FetchDirection) -> bool {
        let flag = self.loadings.flag(direction);
        if *flag {
            debug!(
                conversation_id = %self.conversation_id,
                ?direction,
                "messages: fetch already in flight, dropping request"
            );
            return false;
        }
        *flag = true;
        true
    }

    fn plan(&self, direction: FetchDirection, timestamp: i64, limit: u32) -> FetchPlan {
        FetchPlan {
            conversation_id: self.conversation_id.clone(),
            direction,
            timestamp,
            limit,
        }
    }

    /// Window anchored at `timestamp`; `limit` picks between the open and
    /// the re-centre sizes.
    pub fn begin_surrounding(&mut self, timestamp: i64, limit: u32) -> Option<FetchPlan> {
        if !self.claim(FetchDirection::Surrounding) {
            return None;
        }
        Some(self.plan(FetchDirection::Surrounding, timestamp, limit))
    }

    pub fn begin_get(&mut self, last_seen: i64) -> Option<FetchPlan> {
        self.begin_surrounding(last_seen, self.limits.surrounding)
    }

    pub fn begin_recenter(&mut self, timestamp: i64) -> Option<FetchPlan> {
        self.begin_surrounding(timestamp, self.limits.find_surrounding)
    }

    pub fn begin_previous(&mut self) -> Option<FetchPlan> {
        if !self.more_before {
            return None;
        }
        let anchor = self
            .chain
            .first()
            .and_then(|id| self.chain.message(id))
            .map(Message::timestamp)?;
        self.claim(FetchDirection::Previous)
            .then(|| self.plan(FetchDirection::Previous, anchor, self.limits.previous))
    }

    pub fn begin_next(&mut self) -> Option<FetchPlan> {
        if !self.more_after {
            return None;
        }
        let anchor = self
            .chain
            .last()
            .and_then(|id| self.chain.message(id))
            .map(Message::timestamp)?;
        self.claim(FetchDirection::Next)
            .then(|| self.plan(FetchDirection::Next, anchor, self.limits.next))
    }

    /// Releases the direction; boundary flags stay as they were so the
    /// request can simply be retried.
    pub fn fail_fetch(&mut self, direction: FetchDirection) {
        *self.loadings.flag(direction) = false;
    }

    /// Merges an opening window, keeping optimistic nodes as the newest.
    pub fn apply_surrounding(&mut self, page: SurroundingPage) {
        self.more_before = page.more_before;
        self.more_after = page.more_after;
        self.update_chain(Message::list_from(page.messages));
        self.loadings.get = false;
    }

    /// Replaces the whole window around a jump target.
    pub fn apply_recenter(&mut self, page: SurroundingPage) {
        self.more_before = page.more_before;
        self.more_after = page.more_after;
        self.chain.init(Message::list_from(page.messages));
        self.loadings.get = false;
    }

    pub fn apply_previous(&mut self, messages: Vec<MessagePayload>) {
        self.more_before = !messages.is_empty();
        self.chain.add_prev_messages(Message::list_from(messages));
        self.loadings.prev = false;
    }

    /// The next endpoint repeats the anchor message first and returns the
    /// rest oldest-first.
    pub fn apply_next(&mut self, mut messages: Vec<MessagePayload>) {
        if !messages.is_empty() {
            messages.remove(0);
        }
        messages.reverse();
        self.more_after = !messages.is_empty();
        self.chain.add_next_messages(Message::list_from(messages));
        self.loadings.next = false;
    }

    fn update_chain(&mut self, messages: Vec<Message>) {
        let known: HashSet<MessageId> = self
            .chain
            .iter()
            .map(|(_, link)| link.message.id().clone())
            .collect();
        let links = self.chain.update(messages);
        if self.divider.is_some() {
            return;
        }

        let fresh: Vec<LinkId> = links
            .iter()
            .copied()
            .take_while(|id| {
                self.chain
                    .message(*id)
                    .is_some_and(|message| !known.contains(message.id()))
            })
            .collect();
        self.divider = fresh
            .iter()
            .rev()
            .find_map(|id| self.unseen_candidate(*id));
    }

    fn unseen_candidate(&self, id: LinkId) -> Option<MessageId> {
        let message = self.chain.message(id)?;
        (self.authored_tri(message) == Tri::False).then(|| message.id().clone())
    }

    fn authored_tri(&self, message: &Message) -> Tri {
        if message.is_system() {
            Tri::NotApplicable
        } else {
            (message.sender.id == self.self_id).into()
        }
    }

    /// Sets the divider at `message` unless one is already placed or the
    /// local user wrote it.
    fn offer_divider(&mut self, message: &Message) {
        if self.divider.is_none() && self.authored_tri(message) == Tri::False {
            self.divider = Some(message.id().clone());
        }
    }

    // ---- inserts ----

    fn find_pending_match(&self, incoming: &Message) -> Option<LinkId> {
        // Oldest pending match wins.
        let mut found = None;
        for (id, link) in self.chain.iter() {
            if link.message.is_pending_match(incoming) {
                found = Some(id);
            }
        }
        found
    }

    /// Real-time delivery. Confirms a pending optimistic node when one
    /// matches, otherwise appends.
    pub fn add_incoming(&mut self, incoming: Message) -> Incoming {
        if self.more_after {
            self.offer_divider(&incoming);
            return Incoming::OutsideWindow;
        }
        if let Some(id) = self.chain.find_by_message_id(incoming.id()) {
            return Incoming::Duplicate(id);
        }
        if let Some(id) = self.find_pending_match(&incoming) {
            if let Some(pending) = self.chain.message_mut(id) {
                pending.confirm(incoming.id().clone());
                debug!(
                    conversation_id = %self.conversation_id,
                    message_id = %incoming.id(),
                    "messages: push confirmed pending message"
                );
            }
            return Incoming::Reconciled(id);
        }
        self.offer_divider(&incoming);
        Incoming::Inserted(self.chain.add(incoming))
    }

    /// Locally authored message, appended unconditionally.
    pub fn add_local(&mut self, message: Message) -> LinkId {
        self.offer_divider(&message);
        self.chain.add(message)
    }

    pub fn remove(&mut self, id: LinkId) -> Option<Message> {
        self.chain.delete(id)
    }

    pub fn remove_by_key(&mut self, key: LocalKey) -> Option<Message> {
        let id = self.chain.find_by_local_key(key)?;
        self.chain.delete(id)
    }

    // ---- lookups ----

    pub fn find(&self, message_id: &MessageId) -> Option<LinkId> {
        self.chain.find_by_message_id(message_id)
    }

    pub fn find_by_key(&self, key: LocalKey) -> Option<LinkId> {
        self.chain.find_by_local_key(key)
    }

    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.find(message_id).and_then(|id| self.chain.message(id))
    }

    pub fn message_mut(&mut self, message_id: &MessageId) -> Option<&mut Message> {
        let id = self.find(message_id)?;
        self.chain.message_mut(id)
    }

    pub fn message_by_key_mut(&mut self, key: LocalKey) -> Option<&mut Message> {
        let id = self.find_by_key(key)?;
        self.chain.message_mut(id)
    }

    pub fn newest(&self) -> Option<&Message> {
        self.chain.last().and_then(|id| self.chain.message(id))
    }

    /// Keyboard of the newest message that has buttons. A hidden keyboard
    /// clears it, and a one-time keyboard only counts on the newest message.
    pub fn keyboard(&self) -> Option<ActiveKeyboard> {
        let (position, message, keyboard) = self
            .chain
            .iter()
            .enumerate()
            .find_map(|(position, (_, link))| {
                let keyboard = link.message.keyboard.as_ref()?;
                (!keyboard.buttons.is_empty()).then_some((position, &link.message, keyboard))
            })?;
        if keyboard.hide || (keyboard.one_time && position != 0) {
            return None;
        }
        Some(ActiveKeyboard {
            message_id: message.id().clone(),
            buttons: keyboard.buttons.clone(),
        })
    }

    // ---- read state ----

    /// Timestamp to acknowledge: the newest settled message, and only when
    /// the window reaches the live edge.
    pub fn read_target(&self) -> Option<i64> {
        if self.more_after {
            return None;
        }
        self.chain
            .iter()
            .find(|(_, link)| link.message.is_settled())
            .map(|(_, link)| link.message.timestamp())
    }

    /// Another member read the conversation: every loaded own message is
    /// now seen.
    pub fn mark_own_read(&mut self) {
        let own: Vec<LinkId> = self
            .chain
            .iter()
            .filter(|(_, link)| self.authored_tri(&link.message) == Tri::True)
            .map(|(id, _)| id)
            .collect();
        for id in own {
            if let Some(message) = self.chain.message_mut(id) {
                message.set_read();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/chat_messages_tests.rs"]
mod tests;

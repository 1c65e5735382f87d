//! Ordered window of loaded messages for one conversation.
//!
//! Nodes live in an arena keyed by [`LinkId`]; neighbours are stored as ids,
//! so splices only rewrite the handful of boundary nodes they touch. `prev`
//! points at the older neighbour and `next` at the newer one. `first` is the
//! oldest loaded node and `last` the newest.
//!
//! Batches handed to the chain are ordered newest-first, matching the fetch
//! endpoints.

use std::collections::{HashMap, HashSet};

use chrono::{FixedOffset, NaiveDate};
use shared::domain::{MessageId, UserId};

use crate::message::{LocalKey, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

/// Answer to a question that does not apply to every message (system
/// messages have no sender block and no author).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tri {
    NotApplicable,
    True,
    False,
}

impl Tri {
    pub fn is_true(self) -> bool {
        self == Tri::True
    }
}

impl From<bool> for Tri {
    fn from(value: bool) -> Self {
        if value {
            Tri::True
        } else {
            Tri::False
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageLink {
    pub message: Message,
    prev: Option<LinkId>,
    next: Option<LinkId>,
}

impl MessageLink {
    pub fn prev(&self) -> Option<LinkId> {
        self.prev
    }

    pub fn next(&self) -> Option<LinkId> {
        self.next
    }
}

/// Inputs for the presentation groupings derived from neighbours.
#[derive(Debug, Clone, Copy)]
pub struct LinkContext<'a> {
    pub self_id: &'a UserId,
    /// Node where unseen messages start.
    pub divider: Option<LinkId>,
    pub offset: FixedOffset,
}

/// Read-only snapshot of one node with its derived groupings.
#[derive(Debug, Clone)]
pub struct MessageView {
    pub link: LinkId,
    pub message: Message,
    pub is_self: Tri,
    pub is_start: Tri,
    pub is_finish: Tri,
    pub is_first_of_day: bool,
    pub is_start_of_new_messages: bool,
}

#[derive(Debug, Default)]
pub struct MessageChain {
    nodes: HashMap<LinkId, MessageLink>,
    first: Option<LinkId>,
    last: Option<LinkId>,
    next_id: u64,
}

impl MessageChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Oldest loaded node.
    pub fn first(&self) -> Option<LinkId> {
        self.first
    }

    /// Newest loaded node.
    pub fn last(&self) -> Option<LinkId> {
        self.last
    }

    pub fn get(&self, id: LinkId) -> Option<&MessageLink> {
        self.nodes.get(&id)
    }

    pub fn message(&self, id: LinkId) -> Option<&Message> {
        self.nodes.get(&id).map(|link| &link.message)
    }

    pub fn message_mut(&mut self, id: LinkId) -> Option<&mut Message> {
        self.nodes.get_mut(&id).map(|link| &mut link.message)
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Newest to oldest.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            chain: self,
            cursor: self.last,
        }
    }

    pub fn ids(&self) -> Vec<LinkId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn messages(&self) -> Vec<&Message> {
        self.iter().map(|(_, link)| &link.message).collect()
    }

    // Linear scans; the window is small.

    pub fn find_by_message_id(&self, message_id: &MessageId) -> Option<LinkId> {
        self.iter()
            .find(|(_, link)| link.message.id() == message_id)
            .map(|(id, _)| id)
    }

    pub fn find_by_local_key(&self, key: LocalKey) -> Option<LinkId> {
        self.iter()
            .find(|(_, link)| link.message.local_key() == key)
            .map(|(id, _)| id)
    }

    /// Drops everything and rebuilds from a newest-first batch.
    pub fn init(&mut self, messages: Vec<Message>) -> Vec<LinkId> {
        self.nodes.clear();
        let links = self.build(messages);
        self.last = links.first().copied();
        self.first = links.last().copied();
        links
    }

    /// Replaces the settled part of the window with a fresh batch. Nodes that
    /// are still sending survive and stay the newest. Returns the ids of the
    /// fetched nodes, newest-first.
    pub fn update(&mut self, messages: Vec<Message>) -> Vec<LinkId> {
        let sending: Vec<LinkId> = self
            .iter()
            .filter(|(_, link)| link.message.is_sending())
            .map(|(id, _)| id)
            .collect();
        let keep: HashSet<LinkId> = sending.iter().copied().collect();
        self.nodes.retain(|id, _| keep.contains(id));

        for (index, id) in sending.iter().enumerate() {
            let newer = index.checked_sub(1).map(|i| sending[i]);
            let older = sending.get(index + 1).copied();
            if let Some(node) = self.nodes.get_mut(id) {
                node.next = newer;
                node.prev = older;
            }
        }

        let links = self.build(messages);
        if let (Some(&oldest_sending), Some(&newest_fetched)) = (sending.last(), links.first()) {
            self.set_prev(oldest_sending, Some(newest_fetched));
            self.set_next(newest_fetched, Some(oldest_sending));
        }

        self.last = sending.first().or(links.first()).copied();
        self.first = links.last().or(sending.last()).copied();
        links
    }

    /// Appends as the newest node.
    pub fn add(&mut self, message: Message) -> LinkId {
        let id = self.alloc(message);
        match self.last {
            Some(last) => {
                self.set_next(last, Some(id));
                self.set_prev(id, Some(last));
            }
            None => self.first = Some(id),
        }
        self.last = Some(id);
        id
    }

    /// Splices a newest-first batch past the current newest node.
    pub fn add_next_messages(&mut self, messages: Vec<Message>) -> Vec<LinkId> {
        let links = self.build(messages);
        let (Some(&newest), Some(&oldest)) = (links.first(), links.last()) else {
            return links;
        };
        match self.last {
            Some(last) => {
                self.set_next(last, Some(oldest));
                self.set_prev(oldest, Some(last));
            }
            None => self.first = Some(oldest),
        }
        self.last = Some(newest);
        links
    }

    /// Splices a newest-first batch before the current oldest node.
    pub fn add_prev_messages(&mut self, messages: Vec<Message>) -> Vec<LinkId> {
        let links = self.build(messages);
        let (Some(&newest), Some(&oldest)) = (links.first(), links.last()) else {
            return links;
        };
        match self.first {
            Some(first) => {
                self.set_prev(first, Some(newest));
                self.set_next(newest, Some(first));
            }
            None => self.last = Some(newest),
        }
        self.first = Some(oldest);
        links
    }

    /// Excises one node and joins its neighbours.
    pub fn delete(&mut self, id: LinkId) -> Option<Message> {
        let node = self.nodes.remove(&id)?;
        match node.prev {
            Some(prev) => self.set_next(prev, node.next),
            None => self.first = node.next,
        }
        match node.next {
            Some(next) => self.set_prev(next, node.prev),
            None => self.last = node.prev,
        }
        Some(node.message)
    }

    /// Walks the whole chain and reports the first broken link, if any.
    #[cfg(test)]
    pub(crate) fn check_links(&self) -> Result<(), String> {
        let mut seen = 0usize;
        let mut cursor = self.last;
        let mut newer: Option<LinkId> = None;
        while let Some(id) = cursor {
            let node = self
                .nodes
                .get(&id)
                .ok_or_else(|| format!("dangling link {id:?}"))?;
            if node.next != newer {
                return Err(format!(
                    "link {id:?} points forward to {:?}, expected {newer:?}",
                    node.next
                ));
            }
            seen += 1;
            if seen > self.nodes.len() {
                return Err("cycle detected".to_string());
            }
            if node.prev.is_none() && self.first != Some(id) {
                return Err(format!("chain ends at {id:?} but first is {:?}", self.first));
            }
            newer = Some(id);
            cursor = node.prev;
        }
        if seen != self.nodes.len() {
            return Err(format!(
                "{} nodes reachable out of {}",
                seen,
                self.nodes.len()
            ));
        }
        if seen == 0 && (self.first.is_some() || self.last.is_some()) {
            return Err("empty chain with boundary handles".to_string());
        }
        Ok(())
    }

    // ---- presentation ----

    fn day(&self, id: LinkId, offset: FixedOffset) -> Option<NaiveDate> {
        self.message(id)
            .map(|message| message.created_at.with_timezone(&offset).date_naive())
    }

    /// First loaded message of its calendar day.
    pub fn is_first_of_day(&self, id: LinkId, offset: FixedOffset) -> bool {
        match self.get(id).and_then(|link| link.prev) {
            None => true,
            Some(prev) => self.day(id, offset) != self.day(prev, offset),
        }
    }

    pub fn start_of_day(&self, id: LinkId, offset: FixedOffset) -> Option<LinkId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.is_first_of_day(current, offset) {
                return Some(current);
            }
            cursor = self.get(current)?.prev;
        }
        None
    }

    pub fn is_self(&self, id: LinkId, ctx: &LinkContext<'_>) -> Tri {
        match self.message(id) {
            Some(message) if !message.is_system() => (&message.sender.id == ctx.self_id).into(),
            _ => Tri::NotApplicable,
        }
    }

    fn breaks_block(&self, id: LinkId, neighbour: Option<LinkId>) -> bool {
        let (Some(message), Some(neighbour)) = (self.message(id), neighbour) else {
            return true;
        };
        match self.message(neighbour) {
            Some(other) => other.is_system() || other.sender.id != message.sender.id,
            None => true,
        }
    }

    /// Opens a block of consecutive messages from one sender.
    pub fn is_start(&self, id: LinkId, ctx: &LinkContext<'_>) -> Tri {
        let Some(link) = self.get(id) else {
            return Tri::NotApplicable;
        };
        if link.message.is_system() {
            return Tri::NotApplicable;
        }
        (ctx.divider == Some(id)
            || self.is_first_of_day(id, ctx.offset)
            || self.breaks_block(id, link.prev))
        .into()
    }

    /// Closes a block of consecutive messages from one sender.
    pub fn is_finish(&self, id: LinkId, ctx: &LinkContext<'_>) -> Tri {
        let Some(link) = self.get(id) else {
            return Tri::NotApplicable;
        };
        if link.message.is_system() {
            return Tri::NotApplicable;
        }
        let closes = match link.next {
            None => true,
            Some(next) => {
                ctx.divider == Some(next)
                    || self.is_first_of_day(next, ctx.offset)
                    || self.breaks_block(id, Some(next))
            }
        };
        closes.into()
    }

    pub fn start_of_block(&self, id: LinkId, ctx: &LinkContext<'_>) -> Option<LinkId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.is_start(current, ctx) {
                Tri::NotApplicable => return None,
                Tri::True => return Some(current),
                Tri::False => cursor = self.get(current)?.prev,
            }
        }
        None
    }

    pub fn end_of_block(&self, id: LinkId, ctx: &LinkContext<'_>) -> Option<LinkId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.is_finish(current, ctx) {
                Tri::NotApplicable => return None,
                Tri::True => return Some(current),
                Tri::False => cursor = self.get(current)?.next,
            }
        }
        None
    }

    pub fn views(&self, ctx: &LinkContext<'_>) -> Vec<MessageView> {
        self.iter()
            .map(|(id, link)| MessageView {
                link: id,
                message: link.message.clone(),
                is_self: self.is_self(id, ctx),
                is_start: self.is_start(id, ctx),
                is_finish: self.is_finish(id, ctx),
                is_first_of_day: self.is_first_of_day(id, ctx.offset),
                is_start_of_new_messages: ctx.divider == Some(id),
            })
            .collect()
    }

    // ---- internals ----

    fn alloc(&mut self, message: Message) -> LinkId {
        let id = LinkId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            MessageLink {
                message,
                prev: None,
                next: None,
            },
        );
        id
    }

    /// Links a newest-first batch among itself; boundaries are left open.
    fn build(&mut self, messages: Vec<Message>) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = Vec::with_capacity(messages.len());
        for message in messages {
            let id = self.alloc(message);
            if let Some(&newer) = links.last() {
                self.set_prev(newer, Some(id));
                self.set_next(id, Some(newer));
            }
            links.push(id);
        }
        links
    }

    fn set_prev(&mut self, id: LinkId, prev: Option<LinkId>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.prev = prev;
        }
    }

    fn set_next(&mut self, id: LinkId, next: Option<LinkId>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.next = next;
        }
    }
}

pub struct Iter<'a> {
    chain: &'a MessageChain,
    cursor: Option<LinkId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (LinkId, &'a MessageLink);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let link = self.chain.nodes.get(&id)?;
        self.cursor = link.prev;
        Some((id, link))
    }
}

#[cfg(test)]
#[path = "tests/chain_tests.rs"]
mod tests;

//! Conversation buckets, routing of server pushes, and every user-driven
//! mutation.
//!
//! State sits behind one [`Mutex`]. Each operation locks, mutates, and
//! releases before any network or upload await; after an await the
//! conversation is looked up again by id because it may have moved or gone.
//! Observers get each kind of [`StoreEvent`] at most once per logical
//! operation; a refetch triggered by a push counts as its own operation.

use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Local, Offset, Utc};
use futures::future::join_all;
use shared::{
    domain::{AttachmentId, ConversationId, MessageId, UserId},
    protocol::{
        ConversationPayload, EmotionEventPayload, MemberPayload, MessagePayload,
        MessageRefPayload, PersonRef, SearchPage, SendMessageBody,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::{MessengerApi, MissingMessengerApi},
    chain::{LinkId, MessageView},
    chat_messages::{ActiveKeyboard, ChatMessages, FetchDirection, FetchPlan, Incoming},
    config::StoreOptions,
    conversation::{Conversation, ConversationSnapshot, CurrentUser},
    error::ClientError,
    message::{Layout, LocalKey, Message, SystemEvent},
    upload::upload_sequentially,
};

/// Upper bound of files carried by one outgoing message.
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 10;

/// Hits requested per search page.
pub const SEARCH_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Active,
    Bot,
    Archived,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Bucket membership or order changed.
    ConversationsChanged,
    MessagesChanged {
        conversation_id: ConversationId,
    },
    UnreadChanged {
        conversation_id: ConversationId,
        unread: u32,
    },
    /// Pushes may have been lost while the transport was down.
    PossibleGap {
        conversation_id: ConversationId,
    },
    Error(String),
}

/// A file picked for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct StoreState {
    active: Vec<Conversation>,
    bots: Vec<Conversation>,
    archived: Vec<Conversation>,
    active_id: Option<ConversationId>,
    opened: HashSet<ConversationId>,
    loading_conversations: bool,
    ready: bool,
}

impl StoreState {
    fn bucket(&self, bucket: Bucket) -> &Vec<Conversation> {
        match bucket {
            Bucket::Active => &self.active,
            Bucket::Bot => &self.bots,
            Bucket::Archived => &self.archived,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<Conversation> {
        match bucket {
            Bucket::Active => &mut self.active,
            Bucket::Bot => &mut self.bots,
            Bucket::Archived => &mut self.archived,
        }
    }

    /// Searches active, then archived, then bots.
    fn locate(&self, id: &ConversationId) -> Option<(Bucket, usize)> {
        [Bucket::Active, Bucket::Archived, Bucket::Bot]
            .into_iter()
            .find_map(|bucket| {
                self.bucket(bucket)
                    .iter()
                    .position(|conversation| conversation.id() == id)
                    .map(|index| (bucket, index))
            })
    }

    fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        let (bucket, index) = self.locate(id)?;
        self.bucket(bucket).get(index)
    }

    fn conversation_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        let (bucket, index) = self.locate(id)?;
        self.bucket_mut(bucket).get_mut(index)
    }

    fn require_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.conversation_mut(id)
            .ok_or_else(|| ClientError::UnknownConversation(id.clone()).into())
    }

    /// Moves to the front of its bucket; already first is a no-op.
    fn reorder(&mut self, id: &ConversationId) {
        if let Some((bucket, index)) = self.locate(id) {
            if index >= 1 {
                let list = self.bucket_mut(bucket);
                let conversation = list.remove(index);
                list.insert(0, conversation);
            }
        }
    }

    fn take(&mut self, bucket: Bucket, id: &ConversationId) -> Option<(usize, Conversation)> {
        let list = self.bucket_mut(bucket);
        let index = list.iter().position(|conversation| conversation.id() == id)?;
        Some((index, list.remove(index)))
    }

    fn is_active(&self, id: &ConversationId) -> bool {
        self.active_id.as_ref() == Some(id)
    }
}

enum Fetched {
    Surrounding(shared::protocol::SurroundingPage),
    Previous(Vec<MessagePayload>),
    Next(Vec<MessagePayload>),
}

pub struct ConversationStore {
    api: Arc<dyn MessengerApi>,
    user: CurrentUser,
    options: StoreOptions,
    offset: FixedOffset,
    inner: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    pub fn new(user: CurrentUser) -> Arc<Self> {
        Self::new_with_dependencies(Arc::new(MissingMessengerApi), user, StoreOptions::default())
    }

    pub fn new_with_dependencies(
        api: Arc<dyn MessengerApi>,
        user: CurrentUser,
        options: StoreOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            user,
            options,
            offset: Local::now().offset().fix(),
            inner: Mutex::new(StoreState::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn build(&self, info: ConversationPayload) -> Conversation {
        Conversation::new(info, self.user.id.clone(), self.options.limits)
    }

    fn is_self(&self, user: &UserId) -> bool {
        user == &self.user.id
    }

    // ---- reads ----

    pub async fn is_ready(&self) -> bool {
        self.inner.lock().await.ready
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.inner.lock().await.active_id.clone()
    }

    pub async fn bucket_of(&self, id: &ConversationId) -> Option<Bucket> {
        self.inner.lock().await.locate(id).map(|(bucket, _)| bucket)
    }

    pub async fn conversations(&self, bucket: Bucket) -> Vec<ConversationSnapshot> {
        let state = self.inner.lock().await;
        state
            .bucket(bucket)
            .iter()
            .map(Conversation::snapshot)
            .collect()
    }

    pub async fn conversation(&self, id: &ConversationId) -> Option<ConversationSnapshot> {
        self.inner
            .lock()
            .await
            .conversation(id)
            .map(Conversation::snapshot)
    }

    pub async fn messages(&self, id: &ConversationId) -> Result<Vec<MessageView>> {
        let state = self.inner.lock().await;
        let conversation = state
            .conversation(id)
            .ok_or_else(|| ClientError::UnknownConversation(id.clone()))?;
        Ok(conversation.messages.views(self.offset))
    }

    pub async fn message(&self, id: &ConversationId, message_id: &MessageId) -> Option<Message> {
        let state = self.inner.lock().await;
        state
            .conversation(id)
            .and_then(|conversation| conversation.messages.message(message_id))
            .cloned()
    }

    pub async fn message_by_key(&self, id: &ConversationId, key: LocalKey) -> Option<Message> {
        let state = self.inner.lock().await;
        let conversation = state.conversation(id)?;
        let link = conversation.messages.find_by_key(key)?;
        conversation.messages.chain().message(link).cloned()
    }

    pub async fn pinned(&self, id: &ConversationId) -> Option<Message> {
        let state = self.inner.lock().await;
        state
            .conversation(id)
            .and_then(|conversation| conversation.pinned.clone())
    }

    pub async fn keyboard(&self, id: &ConversationId) -> Option<ActiveKeyboard> {
        let state = self.inner.lock().await;
        state
            .conversation(id)
            .and_then(|conversation| conversation.messages.keyboard())
    }

    /// Sorted by id.
    pub async fn owners(&self, id: &ConversationId) -> Vec<UserId> {
        let state = self.inner.lock().await;
        let mut owners: Vec<UserId> = state
            .conversation(id)
            .map(|conversation| conversation.owners.iter().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }

    pub async fn members(&self, id: &ConversationId) -> Vec<MemberPayload> {
        let state = self.inner.lock().await;
        state
            .conversation(id)
            .map(|conversation| conversation.info.members.clone())
            .unwrap_or_default()
    }

    /// Presentation order: the self conversation (or a placeholder), then
    /// bots, then active conversations that have a last message.
    pub async fn entities(&self) -> Vec<ConversationSnapshot> {
        let state = self.inner.lock().await;
        let mut listed: Vec<&Conversation> = state
            .active
            .iter()
            .filter(|conversation| conversation.has_last_message())
            .collect();

        let mut entities = Vec::with_capacity(listed.len() + state.bots.len() + 1);
        match listed.iter().position(|conversation| conversation.is_saved()) {
            Some(index) => entities.push(listed.remove(index).snapshot()),
            None => entities.push(
                Conversation::saved_placeholder(&self.user, self.options.limits).snapshot(),
            ),
        }
        entities.extend(state.bots.iter().map(Conversation::snapshot));
        entities.extend(listed.into_iter().map(Conversation::snapshot));
        entities
    }

    /// Number of listed conversations with unread messages.
    pub async fn unread_total(&self) -> usize {
        self.entities()
            .await
            .iter()
            .filter(|entity| entity.unread > 0)
            .count()
    }

    // ---- conversation list ----

    pub async fn load_conversations(&self) -> Result<()> {
        {
            let mut state = self.inner.lock().await;
            if state.loading_conversations {
                debug!("store: conversation list already loading");
                return Ok(());
            }
            state.loading_conversations = true;
            state.opened.clear();
        }

        let fetched = tokio::try_join!(
            self.api.list_active(0),
            self.api.list_bots(0),
            self.api.list_archived(),
        );

        let mut state = self.inner.lock().await;
        state.loading_conversations = false;
        let (active, bots, archived) = match fetched {
            Ok(lists) => lists,
            Err(err) => {
                drop(state);
                warn!(error = %err, "store: failed to load conversations");
                self.emit(StoreEvent::Error(err.to_string()));
                return Err(err);
            }
        };
        info!(
            active = active.len(),
            bots = bots.len(),
            archived = archived.len(),
            "store: conversations loaded"
        );
        state.active = active.into_iter().map(|info| self.build(info)).collect();
        state.bots = bots.into_iter().map(|info| self.build(info)).collect();
        state.archived = archived.into_iter().map(|info| self.build(info)).collect();
        state.ready = true;
        drop(state);
        self.emit(StoreEvent::ConversationsChanged);
        Ok(())
    }

    /// Fetches one conversation and puts it at the front of active unless
    /// it showed up in some bucket while the request was running.
    pub async fn load_conversation(&self, id: &ConversationId) -> Result<()> {
        self.fetch_conversation(id).await?;
        self.emit(StoreEvent::ConversationsChanged);
        Ok(())
    }

    async fn fetch_conversation(&self, id: &ConversationId) -> Result<()> {
        let info = self.api.get_conversation(id).await?;
        let mut state = self.inner.lock().await;
        match state.conversation_mut(id) {
            Some(existing) => existing.set_info(info),
            None => {
                info!(conversation_id = %id, "store: new conversation");
                let conversation = self.build(info);
                state.active.insert(0, conversation);
            }
        }
        Ok(())
    }

    pub async fn refresh_info(&self, id: &ConversationId) -> Result<()> {
        let info = self.api.get_conversation(id).await?;
        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversation_mut(id) {
            conversation.set_info(info);
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    pub async fn reorder(&self, id: &ConversationId) {
        self.inner.lock().await.reorder(id);
        self.emit(StoreEvent::ConversationsChanged);
    }

    // ---- archive ----

    pub async fn archive(&self, id: &ConversationId) -> Result<()> {
        self.move_between(id, Bucket::Active, Bucket::Archived, true)
            .await
    }

    pub async fn unarchive(&self, id: &ConversationId) -> Result<()> {
        self.move_between(id, Bucket::Archived, Bucket::Active, false)
            .await
    }

    /// Optimistic move, then the remote call; a rejection puts the
    /// conversation back where it was.
    async fn move_between(
        &self,
        id: &ConversationId,
        from: Bucket,
        to: Bucket,
        archived: bool,
    ) -> Result<()> {
        let origin = {
            let mut state = self.inner.lock().await;
            let Some((index, conversation)) = state.take(from, id) else {
                if state.bucket(to).iter().any(|c| c.id() == id) {
                    return Ok(());
                }
                return Err(ClientError::UnknownConversation(id.clone()).into());
            };
            state.bucket_mut(to).insert(0, conversation);
            index
        };
        self.emit(StoreEvent::ConversationsChanged);

        if let Err(err) = self.api.set_archived(id, archived).await {
            warn!(conversation_id = %id, archived, error = %err, "store: archive change rejected, rolling back");
            let mut state = self.inner.lock().await;
            if let Some((_, conversation)) = state.take(to, id) {
                let list = state.bucket_mut(from);
                let index = origin.min(list.len());
                list.insert(index, conversation);
            }
            drop(state);
            self.emit(StoreEvent::ConversationsChanged);
            return Err(err);
        }
        Ok(())
    }

    // ---- activation and reconnect ----

    pub async fn set_active(&self, id: Option<ConversationId>) -> Result<()> {
        let Some(id) = id else {
            self.inner.lock().await.active_id = None;
            self.emit(StoreEvent::ConversationsChanged);
            return Ok(());
        };

        let first_open = {
            let mut state = self.inner.lock().await;
            if state.locate(&id).is_none() {
                return Err(ClientError::UnknownConversation(id).into());
            }
            let first_open = state.opened.insert(id.clone());
            if first_open {
                state.require_mut(&id)?.messages.reset_divider();
            }
            state.active_id = Some(id.clone());
            first_open
        };
        self.emit(StoreEvent::ConversationsChanged);

        if first_open {
            self.get_messages(&id).await?;
            if let Err(err) = self.refresh_pinned(&id).await {
                warn!(conversation_id = %id, error = %err, "store: failed to load pinned message");
            }
        }
        if let Err(err) = self.refresh_members(&id).await {
            warn!(conversation_id = %id, error = %err, "store: failed to load members");
        }
        self.read(&id).await
    }

    /// Transport dropped; every conversation must be re-fetched on open.
    pub async fn clear_opened(&self) {
        self.inner.lock().await.opened.clear();
    }

    /// Transport is back: re-fetch the active window when it sits at the
    /// live edge. Pushes missed while disconnected outside that window are
    /// not recovered.
    pub async fn refresh_active(&self) -> Result<()> {
        let id = {
            let mut state = self.inner.lock().await;
            let Some(id) = state.active_id.clone() else {
                return Ok(());
            };
            let at_live_edge = state
                .conversation(&id)
                .is_some_and(|conversation| !conversation.messages.more_after());
            if !at_live_edge {
                return Ok(());
            }
            state.opened.insert(id.clone());
            id
        };
        info!(conversation_id = %id, "store: refreshing active conversation after reconnect");
        self.get_messages(&id).await?;
        if self.options.report_reconnect_gaps {
            self.emit(StoreEvent::PossibleGap {
                conversation_id: id,
            });
        }
        Ok(())
    }

    // ---- pagination ----

    /// Opening window around the last seen message. Returns whether a fetch
    /// actually ran.
    pub async fn get_messages(&self, id: &ConversationId) -> Result<bool> {
        let last_seen = {
            let state = self.inner.lock().await;
            let conversation = state
                .conversation(id)
                .ok_or_else(|| ClientError::UnknownConversation(id.clone()))?;
            conversation
                .info
                .last_seen
                .unwrap_or_else(Utc::now)
                .timestamp_millis()
        };
        self.paginate(id, false, |messages| messages.begin_get(last_seen))
            .await
    }

    pub async fn previous_messages(&self, id: &ConversationId) -> Result<bool> {
        self.paginate(id, false, ChatMessages::begin_previous).await
    }

    pub async fn next_messages(&self, id: &ConversationId) -> Result<bool> {
        self.paginate(id, false, ChatMessages::begin_next).await
    }

    /// Replaces the window with one centred on `timestamp`.
    pub async fn surround(&self, id: &ConversationId, timestamp: i64) -> Result<bool> {
        self.paginate(id, true, |messages| messages.begin_recenter(timestamp))
            .await
    }

    async fn paginate<F>(&self, id: &ConversationId, recenter: bool, begin: F) -> Result<bool>
    where
        F: FnOnce(&mut ChatMessages) -> Option<FetchPlan>,
    {
        let plan = {
            let mut state = self.inner.lock().await;
            begin(&mut state.require_mut(id)?.messages)
        };
        let Some(plan) = plan else {
            return Ok(false);
        };

        let fetched = match plan.direction {
            FetchDirection::Surrounding => self
                .api
                .load_surrounding(id, plan.timestamp, plan.limit)
                .await
                .map(Fetched::Surrounding),
            FetchDirection::Previous => self
                .api
                .load_previous(id, plan.timestamp, plan.limit)
                .await
                .map(|page| Fetched::Previous(page.messages)),
            FetchDirection::Next => self
                .api
                .load_next(id, plan.timestamp, plan.limit)
                .await
                .map(|page| Fetched::Next(page.messages)),
        };

        let mut state = self.inner.lock().await;
        let Some(conversation) = state.conversation_mut(id) else {
            debug!(conversation_id = %id, "store: conversation gone before page arrived");
            return fetched.map(|_| false);
        };
        let messages = &mut conversation.messages;
        match fetched {
            Ok(Fetched::Surrounding(page)) if recenter => messages.apply_recenter(page),
            Ok(Fetched::Surrounding(page)) => messages.apply_surrounding(page),
            Ok(Fetched::Previous(page)) => messages.apply_previous(page),
            Ok(Fetched::Next(page)) => messages.apply_next(page),
            Err(err) => {
                messages.fail_fetch(plan.direction);
                drop(state);
                warn!(conversation_id = %id, direction = ?plan.direction, error = %err, "store: page fetch failed");
                return Err(err);
            }
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(true)
    }

    /// Jumps to a message, re-centring the window once when it is not
    /// loaded.
    pub async fn find_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
        created_at: DateTime<Utc>,
    ) -> Result<Option<LinkId>> {
        let found = {
            let state = self.inner.lock().await;
            state
                .conversation(id)
                .ok_or_else(|| ClientError::UnknownConversation(id.clone()))?
                .messages
                .find(message_id)
        };
        if found.is_some() {
            return Ok(found);
        }
        self.surround(id, created_at.timestamp_millis()).await?;
        let state = self.inner.lock().await;
        Ok(state
            .conversation(id)
            .and_then(|conversation| conversation.messages.find(message_id)))
    }

    // ---- read state ----

    /// Acknowledges the newest settled message when the window reaches the
    /// live edge, then clears the unread counter.
    pub async fn read(&self, id: &ConversationId) -> Result<()> {
        let target = {
            let state = self.inner.lock().await;
            state
                .conversation(id)
                .ok_or_else(|| ClientError::UnknownConversation(id.clone()))?
                .messages
                .read_target()
        };
        let Some(timestamp) = target else {
            return Ok(());
        };
        self.api.mark_read(id, timestamp).await?;

        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversation_mut(id) {
            conversation.set_unread(0);
        }
        drop(state);
        self.emit(StoreEvent::UnreadChanged {
            conversation_id: id.clone(),
            unread: 0,
        });
        Ok(())
    }

    // ---- sending ----

    fn draft(&self, id: &ConversationId) -> Message {
        Message::draft(self.user.person(), id.clone(), "")
    }

    /// Sends text, an optional quoted message, and files. Files are split
    /// into messages of at most [`MAX_ATTACHMENTS_PER_MESSAGE`]; text and
    /// quote ride on the first one. Returns the local keys of the created
    /// messages; send failures are recorded on the messages themselves.
    pub async fn send(
        &self,
        id: &ConversationId,
        text: &str,
        files: Vec<OutgoingFile>,
        quote: Option<&MessageId>,
    ) -> Result<Vec<LocalKey>> {
        let text = text.trim();
        if text.is_empty() && files.is_empty() {
            return Ok(Vec::new());
        }

        let quoted = match quote {
            Some(message_id) => {
                let state = self.inner.lock().await;
                let conversation = state
                    .conversation(id)
                    .ok_or_else(|| ClientError::UnknownConversation(id.clone()))?;
                let message = conversation.messages.message(message_id).ok_or_else(|| {
                    ClientError::UnknownMessage {
                        conversation_id: id.clone(),
                        message_id: message_id.clone(),
                    }
                })?;
                Some(message.as_forward())
            }
            None => None,
        };

        let mut drafts = Vec::new();
        if files.is_empty() {
            drafts.push(self.draft(id).with_body(text).with_forward(quoted));
        } else {
            let mut groups: Vec<Vec<OutgoingFile>> = Vec::new();
            for file in files {
                match groups.last_mut() {
                    Some(group) if group.len() < MAX_ATTACHMENTS_PER_MESSAGE => group.push(file),
                    _ => groups.push(vec![file]),
                }
            }
            for (index, group) in groups.into_iter().enumerate() {
                let uploads = group
                    .into_iter()
                    .map(|file| {
                        self.api
                            .prepare_upload(&file.filename, &file.mime_type, file.bytes)
                    })
                    .collect();
                let mut draft = self.draft(id).with_uploads(uploads);
                if index == 0 {
                    draft = draft.with_body(text).with_forward(quoted.clone());
                }
                drafts.push(draft);
            }
        }

        let keys = {
            let mut state = self.inner.lock().await;
            let conversation = state.require_mut(id)?;
            let mut keys = Vec::with_capacity(drafts.len());
            for mut draft in drafts {
                draft.mark_sending(true);
                keys.push(draft.local_key());
                conversation.messages.add_local(draft);
            }
            keys
        };
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });

        join_all(keys.iter().map(|key| self.deliver(id, *key))).await;
        Ok(keys)
    }

    async fn deliver(&self, id: &ConversationId, key: LocalKey) {
        match self.transmit(id, key).await {
            Ok(Some(server_id)) => {
                let mut state = self.inner.lock().await;
                if let Some(conversation) = state.conversation_mut(id) {
                    if let Some(message) = conversation.messages.message_by_key_mut(key) {
                        message.confirm(server_id);
                        let message = message.clone();
                        conversation.update_last_message(&message);
                    }
                }
                drop(state);
                self.emit(StoreEvent::MessagesChanged {
                    conversation_id: id.clone(),
                });
            }
            Ok(None) => {}
            Err(err) => {
                self.emit(StoreEvent::Error(err.to_string()));
            }
        }
    }

    /// Uploads pending files one by one, then posts the message. Failures
    /// are recorded on the message. `None` means the message disappeared
    /// (cancelled or conversation left) while work was in flight.
    async fn transmit(&self, id: &ConversationId, key: LocalKey) -> Result<Option<MessageId>> {
        let requests = {
            let mut state = self.inner.lock().await;
            let Some(message) = state
                .conversation_mut(id)
                .and_then(|conversation| conversation.messages.message_by_key_mut(key))
            else {
                return Ok(None);
            };
            message.begin_uploads()
        };

        let uploaded = if requests.is_empty() {
            None
        } else {
            Some(upload_sequentially(&requests).await)
        };

        let body = {
            let mut state = self.inner.lock().await;
            let Some(message) = state
                .conversation_mut(id)
                .and_then(|conversation| conversation.messages.message_by_key_mut(key))
            else {
                debug!(conversation_id = %id, %key, "store: message withdrawn during upload");
                return Ok(None);
            };
            match uploaded {
                Some(Ok(attachments)) => message.finish_uploads(attachments),
                Some(Err(err)) => {
                    warn!(conversation_id = %id, %key, error = %err, "store: upload failed");
                    let err = Arc::new(err);
                    message.fail_uploads(err.clone());
                    return Err(anyhow::anyhow!(err));
                }
                None => {}
            }
            send_body(message)
        };

        match self.api.send_message(body).await {
            Ok(server_id) => Ok(Some(server_id)),
            Err(err) => {
                warn!(conversation_id = %id, %key, error = %err, "store: send failed");
                let err = Arc::new(err);
                let mut state = self.inner.lock().await;
                if let Some(message) = state
                    .conversation_mut(id)
                    .and_then(|conversation| conversation.messages.message_by_key_mut(key))
                {
                    message.mark_error(err.clone());
                }
                Err(anyhow::anyhow!(err))
            }
        }
    }

    /// Retries a failed message. On success the old node is dropped and the
    /// message is appended again as the newest.
    pub async fn resend(&self, id: &ConversationId, key: LocalKey) -> Result<()> {
        {
            let mut state = self.inner.lock().await;
            let conversation = state.require_mut(id)?;
            let message = conversation
                .messages
                .find_by_key(key)
                .and_then(|link| conversation.messages.chain().message(link))
                .ok_or(ClientError::MessageGone(key))?;
            if !message.has_error() {
                return Err(ClientError::ResendNotAllowed(message.id().clone()).into());
            }
            if !self.is_self(&message.sender.id) {
                return Err(ClientError::NotOwnMessage(message.id().clone()).into());
            }
            if !conversation.try_begin_resend() {
                return Err(ClientError::ResendInFlight(id.clone()).into());
            }
            if let Some(message) = conversation.messages.message_by_key_mut(key) {
                message.clear_error();
                message.mark_sending(true);
            }
        }
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });

        let result = self.transmit(id, key).await;

        let mut state = self.inner.lock().await;
        let Some(conversation) = state.conversation_mut(id) else {
            return result.map(|_| ());
        };
        conversation.finish_resend();
        if let Ok(Some(server_id)) = &result {
            if let Some(mut message) = conversation.messages.remove_by_key(key) {
                message.confirm(server_id.clone());
                conversation.update_last_message(&message);
                conversation.messages.add_local(message);
            }
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        result.map(|_| ())
    }

    /// Aborts the transfers of a message still uploading and drops it from
    /// the chain without waiting for the transport.
    pub async fn cancel(&self, id: &ConversationId, key: LocalKey) -> Result<bool> {
        let removed = {
            let mut state = self.inner.lock().await;
            let conversation = state.require_mut(id)?;
            match conversation.messages.message_by_key_mut(key) {
                Some(message) if message.is_loading() => {
                    message.stop_uploads();
                    conversation.messages.remove_by_key(key).is_some()
                }
                _ => false,
            }
        };
        if removed {
            info!(conversation_id = %id, %key, "store: upload cancelled");
            self.emit(StoreEvent::MessagesChanged {
                conversation_id: id.clone(),
            });
        }
        Ok(removed)
    }

    /// Failed messages and messages still uploading only exist locally and
    /// are dropped; anything else is marked deleted and removed remotely.
    pub async fn delete_link(&self, id: &ConversationId, key: LocalKey) -> Result<()> {
        let remote = {
            let mut state = self.inner.lock().await;
            let conversation = state.require_mut(id)?;
            let message = conversation
                .messages
                .message_by_key_mut(key)
                .ok_or(ClientError::MessageGone(key))?;
            if message.has_error() {
                conversation.messages.remove_by_key(key);
                None
            } else if message.is_sending() && message.is_loading() {
                message.stop_uploads();
                conversation.messages.remove_by_key(key);
                None
            } else {
                message.set_deleted();
                Some(message.id().clone())
            }
        };
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        if let Some(message_id) = remote {
            self.api.delete_message(&message_id).await?;
        }
        Ok(())
    }

    /// Edits an own message. While uploads are pending only the local body
    /// changes; otherwise the server copy replaces the optimistic one and a
    /// rejection restores the previous body.
    pub async fn edit(&self, id: &ConversationId, key: LocalKey, body: &str) -> Result<()> {
        let (message_id, previous) = {
            let mut state = self.inner.lock().await;
            let conversation = state.require_mut(id)?;
            let message = conversation
                .messages
                .message_by_key_mut(key)
                .ok_or(ClientError::MessageGone(key))?;
            if message.sender.id != self.user.id {
                return Err(ClientError::NotOwnMessage(message.id().clone()).into());
            }
            if message.body == body || (body.is_empty() && message.attachments.is_empty()) {
                return Ok(());
            }
            if message.is_loading() {
                message.body = body.to_string();
                drop(state);
                self.emit(StoreEvent::MessagesChanged {
                    conversation_id: id.clone(),
                });
                return Ok(());
            }
            if message.is_sending() {
                return Ok(());
            }
            let previous = std::mem::replace(&mut message.body, body.to_string());
            message.mark_sending(true);
            (message.id().clone(), previous)
        };
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });

        let result = self.api.edit_message(&message_id, body).await;

        let mut state = self.inner.lock().await;
        if let Some(message) = state
            .conversation_mut(id)
            .and_then(|conversation| conversation.messages.message_by_key_mut(key))
        {
            match &result {
                Ok(payload) => message.update(payload.clone()),
                Err(_) => message.body = previous,
            }
            message.mark_sending(false);
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        result.map(|_| ())
    }

    /// Forwards messages from `source` into `target`, one outgoing message
    /// per source message, oldest first, sent one after another.
    pub async fn forward(
        &self,
        target: &ConversationId,
        source: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<Vec<LocalKey>> {
        let mut originals = {
            let state = self.inner.lock().await;
            let conversation = state
                .conversation(source)
                .ok_or_else(|| ClientError::UnknownConversation(source.clone()))?;
            message_ids
                .iter()
                .map(|message_id| {
                    conversation
                        .messages
                        .message(message_id)
                        .map(Message::as_forward)
                        .ok_or_else(|| ClientError::UnknownMessage {
                            conversation_id: source.clone(),
                            message_id: message_id.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        originals.sort_by_key(|message| message.created_at);

        let mut keys = Vec::with_capacity(originals.len());
        for original in originals {
            let forwarded_id = original.id().clone();
            let mut draft = self.draft(target).with_forward(Some(original));
            draft.mark_sending(true);
            let key = draft.local_key();
            {
                let mut state = self.inner.lock().await;
                state.require_mut(target)?.messages.add_local(draft);
            }
            self.emit(StoreEvent::MessagesChanged {
                conversation_id: target.clone(),
            });
            keys.push(key);

            let body = SendMessageBody {
                room_id: target.clone(),
                forwarded_message_ids: Some(vec![forwarded_id]),
                ..SendMessageBody::default()
            };
            let result = self.api.send_message(body).await;

            let mut state = self.inner.lock().await;
            if let Some(message) = state
                .conversation_mut(target)
                .and_then(|conversation| conversation.messages.message_by_key_mut(key))
            {
                match result {
                    Ok(server_id) => message.confirm(server_id),
                    Err(err) => {
                        warn!(conversation_id = %target, error = %err, "store: forward failed");
                        message.mark_sending(false);
                        message.mark_error(Arc::new(err));
                    }
                }
            }
            drop(state);
            self.emit(StoreEvent::MessagesChanged {
                conversation_id: target.clone(),
            });
        }
        Ok(keys)
    }

    /// Asks the server to toggle the current user's reaction; the chain
    /// changes when the push comes back.
    pub async fn react(&self, message_id: &MessageId, emotion: &str) -> Result<()> {
        self.api.toggle_reaction(message_id, emotion).await
    }

    // ---- conversation settings ----

    pub async fn refresh_pinned(&self, id: &ConversationId) -> Result<()> {
        let pinned = self.api.get_pinned(id).await?;
        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversation_mut(id) {
            conversation.pinned = pinned.map(Message::from_payload);
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    pub async fn pin(&self, id: &ConversationId, message_id: &MessageId) -> Result<()> {
        self.api.pin_message(id, message_id).await?;
        let loaded = {
            let mut state = self.inner.lock().await;
            let conversation = state.require_mut(id)?;
            let loaded = conversation.messages.message(message_id).cloned();
            if loaded.is_some() {
                conversation.pinned = loaded.clone();
            }
            loaded.is_some()
        };
        if !loaded {
            return self.refresh_pinned(id).await;
        }
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    pub async fn unpin(&self, id: &ConversationId) -> Result<()> {
        self.api.unpin_message(id).await?;
        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversation_mut(id) {
            conversation.pinned = None;
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    /// Flips notifications locally first; a rejection is reported but the
    /// local value stays.
    pub async fn set_muted(&self, id: &ConversationId, muted: bool) -> Result<()> {
        self.inner.lock().await.require_mut(id)?.set_muted(muted);
        self.emit(StoreEvent::ConversationsChanged);
        self.api.update_notifications(id, !muted).await
    }

    pub async fn refresh_members(&self, id: &ConversationId) -> Result<()> {
        let page = self.api.room_members(id).await?;
        let mut state = self.inner.lock().await;
        if let Some(conversation) = state.conversation_mut(id) {
            conversation.set_members(page.owners, page.data);
        }
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: id.clone(),
        });
        Ok(())
    }

    // ---- membership ----

    pub async fn add_owner(&self, id: &ConversationId, user_id: &UserId) -> Result<()> {
        self.api.add_owner(id, user_id).await?;
        info!(conversation_id = %id, user_id = %user_id, "store: owner added");
        self.refresh_members(id).await
    }

    pub async fn remove_owner(&self, id: &ConversationId, user_id: &UserId) -> Result<()> {
        self.api.remove_owner(id, user_id).await?;
        info!(conversation_id = %id, user_id = %user_id, "store: owner removed");
        self.refresh_members(id).await
    }

    pub async fn kick(&self, id: &ConversationId, user_id: &UserId) -> Result<()> {
        self.api.kick(id, user_id).await?;
        info!(conversation_id = %id, user_id = %user_id, "store: member removed");
        self.refresh_members(id).await
    }

    /// Members are refetched even when the server refuses some of the
    /// invitations; the refusal is still returned.
    pub async fn invite(&self, id: &ConversationId, user_ids: Vec<UserId>) -> Result<()> {
        let count = user_ids.len();
        let invited = self.api.invite(id, user_ids).await;
        if let Err(err) = &invited {
            warn!(conversation_id = %id, count, error = %err, "store: invite rejected");
        }
        self.refresh_members(id).await?;
        invited
    }

    /// Renames a group and optionally swaps its photo.
    pub async fn update_conversation(
        &self,
        id: &ConversationId,
        name: &str,
        photo: Option<AttachmentId>,
    ) -> Result<()> {
        self.api.update_room(id, name, photo).await?;
        self.refresh_info(id).await
    }

    // ---- search ----

    /// Server-side text search inside one conversation. Pages count from 0;
    /// a blank query finds nothing without asking the server.
    pub async fn search_messages(
        &self,
        id: &ConversationId,
        query: &str,
        page: u32,
    ) -> Result<SearchPage> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchPage {
                data: Vec::new(),
                meta: Default::default(),
            });
        }
        self.api
            .search_messages(id, query, SEARCH_PAGE_LIMIT, page)
            .await
    }

    pub async fn leave(&self, id: &ConversationId) -> Result<()> {
        self.api.leave(id).await?;
        let mut state = self.inner.lock().await;
        if let Some((bucket, _)) = state.locate(id) {
            state.take(bucket, id);
        }
        state.opened.remove(id);
        if state.is_active(id) {
            state.active_id = None;
        }
        drop(state);
        info!(conversation_id = %id, "store: left conversation");
        self.emit(StoreEvent::ConversationsChanged);
        Ok(())
    }

    pub async fn join(&self, id: &ConversationId) -> Result<()> {
        self.api.join(id).await?;
        self.load_conversation(id).await
    }

    pub async fn create_dialog(&self, username: &str) -> Result<ConversationId> {
        self.api.create_dialog(username).await
    }

    pub async fn create_chat(
        &self,
        name: &str,
        user_ids: Vec<UserId>,
        photo: Option<AttachmentId>,
    ) -> Result<ConversationId> {
        self.api.create_chat(name, user_ids, photo).await
    }

    // ---- push handlers ----

    /// The push channel accepted the session.
    pub async fn handle_authorized(&self) -> Result<()> {
        self.api.request_alert_state().await
    }

    /// `notify_room`: a new message in some conversation.
    pub async fn handle_room_update(
        &self,
        room_id: &ConversationId,
        payload: MessagePayload,
    ) -> Result<()> {
        let known = self.inner.lock().await.locate(room_id).is_some();
        if !known {
            self.fetch_conversation(room_id).await?;
        }

        let message = Message::from_payload(payload);
        let system_event = message.system_event();
        let (read_at, outcome) = {
            let mut state = self.inner.lock().await;
            let Some((bucket, _)) = state.locate(room_id) else {
                return Ok(());
            };
            let is_active = state.is_active(room_id);
            state.reorder(room_id);
            let conversation = state.require_mut(room_id)?;
            let applied = self.apply_incoming(conversation, is_active, message);
            if bucket == Bucket::Archived && !conversation.is_muted() {
                if let Some((_, conversation)) = state.take(Bucket::Archived, room_id) {
                    info!(conversation_id = %room_id, "store: new message unarchives conversation");
                    state.active.insert(0, conversation);
                }
            }
            applied
        };
        self.emit(StoreEvent::ConversationsChanged);
        if matches!(outcome, Incoming::Inserted(_) | Incoming::Reconciled(_)) {
            self.emit(StoreEvent::MessagesChanged {
                conversation_id: room_id.clone(),
            });
        }

        if let Some(event) = system_event {
            self.follow_system_event(room_id, event).await;
        }
        if let Some(timestamp) = read_at {
            self.api.mark_read(room_id, timestamp).await?;
        }
        Ok(())
    }

    /// Refetches whatever a system message announced as changed. The
    /// message itself is already applied, so a failed refetch is only logged.
    async fn follow_system_event(&self, room_id: &ConversationId, event: SystemEvent) {
        debug!(conversation_id = %room_id, ?event, "store: system message");
        let refreshed = match event {
            SystemEvent::Pinned | SystemEvent::Unpinned => self.refresh_pinned(room_id).await,
            SystemEvent::MembersChanged => self.refresh_members(room_id).await,
            SystemEvent::Renamed => self.refresh_info(room_id).await,
        };
        if let Err(err) = refreshed {
            warn!(conversation_id = %room_id, ?event, error = %err, "store: refresh after system message failed");
        }
    }

    /// Updates counters and the chain for one inbound message. Returns the
    /// timestamp to acknowledge when the message lands in the open window,
    /// and what the chain did with it.
    fn apply_incoming(
        &self,
        conversation: &mut Conversation,
        is_active: bool,
        message: Message,
    ) -> (Option<i64>, Incoming) {
        conversation.update_last_message(&message);
        let is_self = self.is_self(&message.sender.id);
        let mut read_at = None;
        if is_active {
            if !conversation.messages.more_after() || is_self {
                read_at = Some(message.timestamp());
                conversation.set_unread(0);
            }
        } else if !is_self {
            conversation.increment_unread();
        }
        let outcome = conversation.messages.add_incoming(message);
        debug!(conversation_id = %conversation.id(), ?outcome, "store: inbound message applied");
        (read_at, outcome)
    }

    pub async fn handle_message_read(
        &self,
        room_id: &ConversationId,
        user: &PersonRef,
        last_seen: DateTime<Utc>,
    ) {
        let mut state = self.inner.lock().await;
        let Some(conversation) = state.conversation_mut(room_id) else {
            return;
        };
        conversation.read_from(&user.id, last_seen);
        let unread = conversation.unread();
        drop(state);
        if self.is_self(&user.id) {
            self.emit(StoreEvent::UnreadChanged {
                conversation_id: room_id.clone(),
                unread,
            });
        } else {
            self.emit(StoreEvent::MessagesChanged {
                conversation_id: room_id.clone(),
            });
        }
    }

    pub async fn handle_message_edit(&self, room_id: &ConversationId, payload: MessagePayload) {
        let message_id = payload.id.clone();
        self.with_loaded_message(room_id, &message_id, |message| message.update(payload))
            .await;
    }

    pub async fn handle_message_delete(&self, room_id: &ConversationId, message: &MessageRefPayload) {
        self.with_loaded_message(room_id, &message.id, Message::set_deleted)
            .await;
    }

    pub async fn handle_message_emotion(
        &self,
        room_id: &ConversationId,
        message: &MessageRefPayload,
        emotion: &EmotionEventPayload,
    ) {
        self.with_loaded_message(room_id, &message.id, |loaded| {
            loaded.toggle_reaction(&emotion.user, &emotion.emotion)
        })
        .await;
    }

    async fn with_loaded_message<F>(&self, room_id: &ConversationId, message_id: &MessageId, apply: F)
    where
        F: FnOnce(&mut Message),
    {
        let mut state = self.inner.lock().await;
        let Some(message) = state
            .conversation_mut(room_id)
            .and_then(|conversation| conversation.messages.message_mut(message_id))
        else {
            debug!(conversation_id = %room_id, message_id = %message_id, "store: push for message outside window");
            return;
        };
        apply(message);
        drop(state);
        self.emit(StoreEvent::MessagesChanged {
            conversation_id: room_id.clone(),
        });
    }
}

fn send_body(message: &Message) -> SendMessageBody {
    let forwarded_id = message.forwarded.as_ref().map(|forwarded| forwarded.id().clone());
    if message.layout() == Layout::Forward {
        return SendMessageBody {
            room_id: message.room_id.clone(),
            forwarded_message_ids: forwarded_id.map(|id| vec![id]),
            ..SendMessageBody::default()
        };
    }
    SendMessageBody {
        room_id: message.room_id.clone(),
        body: Some(message.body.clone()),
        attachment_ids: (!message.attachments.is_empty()).then(|| {
            message
                .attachments
                .iter()
                .map(|attachment| attachment.id.clone())
                .collect()
        }),
        forwarded_message_id: forwarded_id,
        forwarded_message_ids: None,
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;

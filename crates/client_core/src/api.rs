use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{AttachmentId, ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        ArchiveBody, ConversationPayload, CreateChatBody, CreateDialogBody, CreatedRoom,
        EditMessageBody, InviteBody, MemberRefBody, MembersPage, MessagePayload,
        MessageRefBody, NextPage, NotificationToggle, PreviousPage, ReactionBody,
        ReadMessagesBody, ResultEnvelope, RoomRefBody, SearchPage, SendMessageBody,
        SurroundingPage, UpdateRoomBody, UpdateSettingsBody,
    },
};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    error::ClientError,
    upload::{HttpUploadRequest, UploadRequest},
};

/// Everything the engine asks of the server.
#[async_trait]
pub trait MessengerApi: Send + Sync {
    async fn list_active(&self, last_update: i64) -> Result<Vec<ConversationPayload>>;
    async fn list_bots(&self, last_update: i64) -> Result<Vec<ConversationPayload>>;
    async fn list_archived(&self) -> Result<Vec<ConversationPayload>>;
    async fn get_conversation(&self, conversation_id: &ConversationId)
        -> Result<ConversationPayload>;

    async fn load_surrounding(
        &self,
        conversation_id: &ConversationId,
        timestamp: i64,
        limit: u32,
    ) -> Result<SurroundingPage>;
    async fn load_previous(
        &self,
        conversation_id: &ConversationId,
        timestamp: i64,
        limit: u32,
    ) -> Result<PreviousPage>;
    async fn load_next(
        &self,
        conversation_id: &ConversationId,
        timestamp: i64,
        limit: u32,
    ) -> Result<NextPage>;

    /// Returns the id the server assigned.
    async fn send_message(&self, body: SendMessageBody) -> Result<MessageId>;
    async fn edit_message(&self, message_id: &MessageId, body: &str) -> Result<MessagePayload>;
    async fn delete_message(&self, message_id: &MessageId) -> Result<()>;
    async fn mark_read(&self, conversation_id: &ConversationId, timestamp: i64) -> Result<()>;
    async fn toggle_reaction(&self, message_id: &MessageId, emotion: &str) -> Result<()>;

    async fn set_archived(&self, conversation_id: &ConversationId, archived: bool) -> Result<()>;
    async fn get_pinned(&self, conversation_id: &ConversationId) -> Result<Option<MessagePayload>>;
    async fn pin_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()>;
    async fn unpin_message(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn update_notifications(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
    ) -> Result<()>;
    async fn room_members(&self, conversation_id: &ConversationId) -> Result<MembersPage>;
    async fn add_owner(&self, conversation_id: &ConversationId, user_id: &UserId) -> Result<()>;
    async fn remove_owner(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> Result<()>;
    async fn kick(&self, conversation_id: &ConversationId, user_id: &UserId) -> Result<()>;
    async fn invite(&self, conversation_id: &ConversationId, user_ids: Vec<UserId>) -> Result<()>;
    async fn update_room(
        &self,
        conversation_id: &ConversationId,
        name: &str,
        photo: Option<AttachmentId>,
    ) -> Result<()>;
    /// Pages count from 0.
    async fn search_messages(
        &self,
        conversation_id: &ConversationId,
        query: &str,
        limit: u32,
        page: u32,
    ) -> Result<SearchPage>;

    async fn leave(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn join(&self, conversation_id: &ConversationId) -> Result<()>;
    async fn create_dialog(&self, username: &str) -> Result<ConversationId>;
    async fn create_chat(
        &self,
        name: &str,
        user_ids: Vec<UserId>,
        photo: Option<AttachmentId>,
    ) -> Result<ConversationId>;

    /// Sent once the push channel reports `authorized`.
    async fn request_alert_state(&self) -> Result<()>;

    fn prepare_upload(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Arc<dyn UploadRequest>;
}

/// Fallback used before a session exists; every call fails.
pub struct MissingMessengerApi;

#[async_trait]
impl MessengerApi for MissingMessengerApi {
    async fn list_active(&self, _last_update: i64) -> Result<Vec<ConversationPayload>> {
        Err(missing())
    }
    async fn list_bots(&self, _last_update: i64) -> Result<Vec<ConversationPayload>> {
        Err(missing())
    }
    async fn list_archived(&self) -> Result<Vec<ConversationPayload>> {
        Err(missing())
    }
    async fn get_conversation(&self, _: &ConversationId) -> Result<ConversationPayload> {
        Err(missing())
    }
    async fn load_surrounding(&self, _: &ConversationId, _: i64, _: u32) -> Result<SurroundingPage> {
        Err(missing())
    }
    async fn load_previous(&self, _: &ConversationId, _: i64, _: u32) -> Result<PreviousPage> {
        Err(missing())
    }
    async fn load_next(&self, _: &ConversationId, _: i64, _: u32) -> Result<NextPage> {
        Err(missing())
    }
    async fn send_message(&self, _: SendMessageBody) -> Result<MessageId> {
        Err(missing())
    }
    async fn edit_message(&self, _: &MessageId, _: &str) -> Result<MessagePayload> {
        Err(missing())
    }
    async fn delete_message(&self, _: &MessageId) -> Result<()> {
        Err(missing())
    }
    async fn mark_read(&self, _: &ConversationId, _: i64) -> Result<()> {
        Err(missing())
    }
    async fn toggle_reaction(&self, _: &MessageId, _: &str) -> Result<()> {
        Err(missing())
    }
    async fn set_archived(&self, _: &ConversationId, _: bool) -> Result<()> {
        Err(missing())
    }
    async fn get_pinned(&self, _: &ConversationId) -> Result<Option<MessagePayload>> {
        Err(missing())
    }
    async fn pin_message(&self, _: &ConversationId, _: &MessageId) -> Result<()> {
        Err(missing())
    }
    async fn unpin_message(&self, _: &ConversationId) -> Result<()> {
        Err(missing())
    }
    async fn update_notifications(&self, _: &ConversationId, _: bool) -> Result<()> {
        Err(missing())
    }
    async fn room_members(&self, _: &ConversationId) -> Result<MembersPage> {
        Err(missing())
    }
    async fn add_owner(&self, _: &ConversationId, _: &UserId) -> Result<()> {
        Err(missing())
    }
    async fn remove_owner(&self, _: &ConversationId, _: &UserId) -> Result<()> {
        Err(missing())
    }
    async fn kick(&self, _: &ConversationId, _: &UserId) -> Result<()> {
        Err(missing())
    }
    async fn invite(&self, _: &ConversationId, _: Vec<UserId>) -> Result<()> {
        Err(missing())
    }
    async fn update_room(&self, _: &ConversationId, _: &str, _: Option<AttachmentId>) -> Result<()> {
        Err(missing())
    }
    async fn search_messages(&self, _: &ConversationId, _: &str, _: u32, _: u32) -> Result<SearchPage> {
        Err(missing())
    }
    async fn leave(&self, _: &ConversationId) -> Result<()> {
        Err(missing())
    }
    async fn join(&self, _: &ConversationId) -> Result<()> {
        Err(missing())
    }
    async fn create_dialog(&self, _: &str) -> Result<ConversationId> {
        Err(missing())
    }
    async fn create_chat(
        &self,
        _: &str,
        _: Vec<UserId>,
        _: Option<AttachmentId>,
    ) -> Result<ConversationId> {
        Err(missing())
    }
    async fn request_alert_state(&self) -> Result<()> {
        Err(missing())
    }
    fn prepare_upload(&self, filename: &str, mime_type: &str, _: Vec<u8>) -> Arc<dyn UploadRequest> {
        Arc::new(MissingUpload {
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
        })
    }
}

fn missing() -> anyhow::Error {
    anyhow::anyhow!("messenger api is not configured")
}

struct MissingUpload {
    filename: String,
    mime_type: String,
}

#[async_trait]
impl UploadRequest for MissingUpload {
    fn filename(&self) -> &str {
        &self.filename
    }
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    async fn start(&self) -> Result<shared::protocol::AttachmentPayload> {
        Err(missing())
    }
    fn abort(&self) {}
}

pub struct HttpMessengerApi {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpMessengerApi {
    pub fn new(base_url: Url, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid api path {path}"))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.url(path)?;
        Ok(self
            .http
            .request(method, url)
            .header("x-access-token", &self.token)
            .header("request-id", Uuid::new_v4().to_string()))
    }

    async fn execute(&self, endpoint: &str, request: RequestBuilder) -> Result<String> {
        debug!(endpoint, "api: request");
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let source = ApiError::from_response(status.as_u16(), &body);
            warn!(endpoint, status = status.as_u16(), error = %source, "api: request rejected");
            return Err(ClientError::Api {
                endpoint: endpoint.to_string(),
                source,
            }
            .into());
        }
        Ok(body)
    }

    async fn fetch<T: DeserializeOwned>(&self, endpoint: &str, request: RequestBuilder) -> Result<T> {
        let body = self.execute(endpoint, request).await?;
        let envelope: ResultEnvelope<T> = serde_json::from_str(&body)
            .with_context(|| format!("invalid response body from {endpoint}"))?;
        Ok(envelope.into_inner())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let request = self.request(Method::GET, path)?.query(query);
        self.fetch(path, request).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let request = self.request(Method::POST, path)?.json(body);
        self.fetch(path, request).await
    }

    /// POST whose response body is ignored.
    async fn post_unit<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let request = self.request(Method::POST, path)?.json(body);
        self.execute(path, request).await.map(|_| ())
    }

    fn page_query(conversation_id: &ConversationId, timestamp: i64, limit: u32) -> Vec<(&'static str, String)> {
        vec![
            ("roomId", conversation_id.to_string()),
            ("timestamp", timestamp.to_string()),
            ("limit", limit.to_string()),
            ("deleted", "true".to_string()),
        ]
    }
}

#[async_trait]
impl MessengerApi for HttpMessengerApi {
    async fn list_active(&self, last_update: i64) -> Result<Vec<ConversationPayload>> {
        self.get(
            "api/rooms/list",
            &[
                ("withoutMembers", "true".to_string()),
                ("lastUpdate", last_update.to_string()),
            ],
        )
        .await
    }

    async fn list_bots(&self, last_update: i64) -> Result<Vec<ConversationPayload>> {
        self.get("api/rooms/bots", &[("lastUpdate", last_update.to_string())])
            .await
    }

    async fn list_archived(&self) -> Result<Vec<ConversationPayload>> {
        self.get(
            "api/rooms/list",
            &[
                ("archived", "true".to_string()),
                ("withoutMembers", "true".to_string()),
            ],
        )
        .await
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationPayload> {
        self.get(&format!("api/rooms/v1/{conversation_id}"), &[]).await
    }

    async fn load_surrounding(
        &self,
        conversation_id: &ConversationId,
        timestamp: i64,
        limit: u32,
    ) -> Result<SurroundingPage> {
        self.get(
            "api/messages/load_surrounding",
            &Self::page_query(conversation_id, timestamp, limit),
        )
        .await
    }

    async fn load_previous(
        &self,
        conversation_id: &ConversationId,
        timestamp: i64,
        limit: u32,
    ) -> Result<PreviousPage> {
        self.get(
            "api/messages/load_previous",
            &Self::page_query(conversation_id, timestamp, limit),
        )
        .await
    }

    async fn load_next(
        &self,
        conversation_id: &ConversationId,
        timestamp: i64,
        limit: u32,
    ) -> Result<NextPage> {
        self.get(
            "api/messages/load_next",
            &Self::page_query(conversation_id, timestamp, limit),
        )
        .await
    }

    async fn send_message(&self, body: SendMessageBody) -> Result<MessageId> {
        self.post("api/messages/send_message", &body).await
    }

    async fn edit_message(&self, message_id: &MessageId, body: &str) -> Result<MessagePayload> {
        self.post(
            "api/messages/edit_message",
            &EditMessageBody {
                message_id: message_id.clone(),
                body: body.to_string(),
            },
        )
        .await
    }

    async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        self.post_unit(
            "api/messages/delete_message",
            &MessageRefBody {
                message_id: message_id.clone(),
            },
        )
        .await
    }

    async fn mark_read(&self, conversation_id: &ConversationId, timestamp: i64) -> Result<()> {
        self.post_unit(
            "api/messages/read_messages",
            &ReadMessagesBody {
                room_id: conversation_id.clone(),
                timestamp,
            },
        )
        .await
    }

    async fn toggle_reaction(&self, message_id: &MessageId, emotion: &str) -> Result<()> {
        self.post_unit(
            "api/messages/emotions",
            &ReactionBody {
                message_id: message_id.clone(),
                emotion_id: emotion.to_string(),
            },
        )
        .await
    }

    async fn set_archived(&self, conversation_id: &ConversationId, archived: bool) -> Result<()> {
        self.post_unit(
            "api/rooms/archive",
            &ArchiveBody {
                room_id: conversation_id.clone(),
                archived,
            },
        )
        .await
    }

    async fn get_pinned(&self, conversation_id: &ConversationId) -> Result<Option<MessagePayload>> {
        self.get(&format!("api/rooms/{conversation_id}/pin"), &[])
            .await
    }

    async fn pin_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()> {
        self.post_unit(
            &format!("api/rooms/{conversation_id}/pin"),
            &MessageRefBody {
                message_id: message_id.clone(),
            },
        )
        .await
    }

    async fn unpin_message(&self, conversation_id: &ConversationId) -> Result<()> {
        let path = format!("api/rooms/{conversation_id}/pin");
        let request = self.request(Method::DELETE, &path)?;
        self.execute(&path, request).await.map(|_| ())
    }

    async fn update_notifications(
        &self,
        conversation_id: &ConversationId,
        enabled: bool,
    ) -> Result<()> {
        self.post_unit(
            "api/rooms/update_settings",
            &UpdateSettingsBody {
                room_id: conversation_id.clone(),
                notifications: NotificationToggle { enabled },
            },
        )
        .await
    }

    async fn room_members(&self, conversation_id: &ConversationId) -> Result<MembersPage> {
        self.get(
            "api/users/search",
            &[
                ("query", "@".to_string()),
                ("page", "1".to_string()),
                ("fromRoom", conversation_id.to_string()),
                ("count", "5000".to_string()),
            ],
        )
        .await
    }

    async fn add_owner(&self, conversation_id: &ConversationId, user_id: &UserId) -> Result<()> {
        self.post_unit(
            "api/rooms/add_owner",
            &MemberRefBody {
                room_id: conversation_id.clone(),
                user_id: user_id.clone(),
            },
        )
        .await
    }

    async fn remove_owner(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        self.post_unit(
            "api/rooms/remove_owner",
            &MemberRefBody {
                room_id: conversation_id.clone(),
                user_id: user_id.clone(),
            },
        )
        .await
    }

    async fn kick(&self, conversation_id: &ConversationId, user_id: &UserId) -> Result<()> {
        self.post_unit(
            "api/rooms/kick",
            &MemberRefBody {
                room_id: conversation_id.clone(),
                user_id: user_id.clone(),
            },
        )
        .await
    }

    async fn invite(&self, conversation_id: &ConversationId, user_ids: Vec<UserId>) -> Result<()> {
        self.post_unit(
            "api/rooms/v1/invite",
            &InviteBody {
                room_id: conversation_id.clone(),
                user_ids,
            },
        )
        .await
    }

    async fn update_room(
        &self,
        conversation_id: &ConversationId,
        name: &str,
        photo: Option<AttachmentId>,
    ) -> Result<()> {
        self.post_unit(
            "api/rooms/update",
            &UpdateRoomBody {
                room_id: conversation_id.clone(),
                name: name.to_string(),
                photo_attachment: photo,
            },
        )
        .await
    }

    async fn search_messages(
        &self,
        conversation_id: &ConversationId,
        query: &str,
        limit: u32,
        page: u32,
    ) -> Result<SearchPage> {
        self.get(
            "api/messages/search",
            &[
                ("query", query.to_string()),
                ("limit", limit.to_string()),
                ("page", page.to_string()),
                ("roomId", conversation_id.to_string()),
            ],
        )
        .await
    }

    async fn leave(&self, conversation_id: &ConversationId) -> Result<()> {
        self.post_unit(
            "api/rooms/leave",
            &RoomRefBody {
                room_id: conversation_id.clone(),
            },
        )
        .await
    }

    async fn join(&self, conversation_id: &ConversationId) -> Result<()> {
        let path = format!("api/rooms/add/{conversation_id}");
        let request = self.request(Method::POST, &path)?;
        self.execute(&path, request).await.map(|_| ())
    }

    async fn create_dialog(&self, username: &str) -> Result<ConversationId> {
        let created: CreatedRoom = self
            .post(
                "api/rooms/create_dialog",
                &CreateDialogBody {
                    username: username.to_string(),
                },
            )
            .await?;
        Ok(created.room_id)
    }

    async fn create_chat(
        &self,
        name: &str,
        user_ids: Vec<UserId>,
        photo: Option<AttachmentId>,
    ) -> Result<ConversationId> {
        let created: CreatedRoom = self
            .post(
                "api/rooms/create_chat",
                &CreateChatBody {
                    name: name.to_string(),
                    user_ids,
                    photo_attachment: photo,
                },
            )
            .await?;
        Ok(created.room_id)
    }

    async fn request_alert_state(&self) -> Result<()> {
        let path = "api/users/v1/alert/state";
        let request = self.request(Method::GET, path)?;
        self.execute(path, request).await.map(|_| ())
    }

    fn prepare_upload(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Arc<dyn UploadRequest> {
        Arc::new(HttpUploadRequest::new(
            self.http.clone(),
            self.base_url.clone(),
            self.token.clone(),
            filename,
            mime_type,
            bytes,
        ))
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;

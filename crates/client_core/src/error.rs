use shared::{
    domain::{ConversationId, MessageId},
    error::ApiError,
};
use thiserror::Error;

use crate::message::LocalKey;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("conversation {0} is not loaded")]
    UnknownConversation(ConversationId),
    #[error("message {message_id} is not in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[error("local message {0} is no longer loaded")]
    MessageGone(LocalKey),
    #[error("message {0} can only be resent after a failed send")]
    ResendNotAllowed(MessageId),
    #[error("a resend is already running in conversation {0}")]
    ResendInFlight(ConversationId),
    #[error("message {0} was not written by the current user")]
    NotOwnMessage(MessageId),
    #[error("upload was cancelled")]
    UploadCancelled,
    #[error("upload of {filename} failed: {reason}")]
    UploadFailed { filename: String, reason: String },
    #[error("server rejected request to {endpoint}: {source}")]
    Api {
        endpoint: String,
        #[source]
        source: ApiError,
    },
}

pub mod api;
pub mod chain;
pub mod chat_messages;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod message;
pub mod store;
pub mod upload;

pub use api::{HttpMessengerApi, MessengerApi, MissingMessengerApi};
pub use chain::{LinkId, MessageChain, MessageLink, MessageView, Tri};
pub use chat_messages::{
    ActiveKeyboard, ChatMessages, FetchDirection, FetchPlan, Incoming, Loadings,
};
pub use config::{PaginationLimits, StoreOptions};
pub use conversation::{Conversation, ConversationSnapshot, CurrentUser};
pub use error::ClientError;
pub use events::{derive_push_url, dispatch, Backoff, PushConnection, TransportEvent};
pub use message::{Layout, LocalKey, Message, Reaction, SystemEvent};
pub use store::{Bucket, ConversationStore, OutgoingFile, StoreEvent, MAX_ATTACHMENTS_PER_MESSAGE};
pub use upload::{upload_sequentially, HttpUploadRequest, UploadRequest};

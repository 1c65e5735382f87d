use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use shared::protocol::ServerEvent;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::store::ConversationStore;

/// What the push transport reports to the store.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Push(ServerEvent),
    Disconnected,
    /// Connected again after a drop.
    Reconnected,
}

pub fn parse_frame(text: &str) -> Result<ServerEvent> {
    serde_json::from_str(text).context("invalid server event")
}

/// Applies one transport event to the store.
pub async fn dispatch(store: &ConversationStore, event: TransportEvent) -> Result<()> {
    match event {
        TransportEvent::Disconnected => {
            store.clear_opened().await;
            Ok(())
        }
        TransportEvent::Reconnected => store.refresh_active().await,
        TransportEvent::Push(event) => match event {
            ServerEvent::Authorized => store.handle_authorized().await,
            ServerEvent::NotifyRoom { room_id, message } => {
                store.handle_room_update(&room_id, message).await
            }
            ServerEvent::NotifyMessageRead {
                room_id,
                user,
                last_seen,
            } => {
                store.handle_message_read(&room_id, &user, last_seen).await;
                Ok(())
            }
            ServerEvent::NotifyMessageEdit { room_id, message } => {
                store.handle_message_edit(&room_id, message).await;
                Ok(())
            }
            ServerEvent::NotifyMessageDelete { room_id, message } => {
                store.handle_message_delete(&room_id, &message).await;
                Ok(())
            }
            ServerEvent::NotifyMessageEmotion {
                room_id,
                message,
                emotion,
            } => {
                store
                    .handle_message_emotion(&room_id, &message, &emotion)
                    .await;
                Ok(())
            }
        },
    }
}

/// `http(s)://host/base` becomes `ws(s)://host/base/ws`.
pub fn derive_push_url(server_url: &Url) -> Result<Url> {
    let scheme = match server_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("server url must be http or https, got {other}")),
    };
    let mut url = server_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {server_url} to {scheme}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Websocket push channel. Frames are dispatched in arrival order; a drop
/// is reported as [`TransportEvent::Disconnected`] and followed by
/// reconnect attempts.
pub struct PushConnection {
    url: Url,
    token: String,
    backoff: Backoff,
}

impl PushConnection {
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            token: token.into(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spawn(self, store: Arc<ConversationStore>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(store, cancel).await })
    }

    pub async fn run(self, store: Arc<ConversationStore>, cancel: CancellationToken) {
        let mut attempt = 0u32;
        let mut connected_before = false;
        while !cancel.is_cancelled() {
            match self.read_until_closed(&store, &cancel, connected_before).await {
                Ok(true) => {
                    connected_before = true;
                    attempt = 0;
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(url = %self.url, "push: connection lost");
                    if let Err(err) = dispatch(&store, TransportEvent::Disconnected).await {
                        warn!(error = %err, "push: failed to apply disconnect");
                    }
                }
                Ok(false) => break,
                Err(err) => warn!(url = %self.url, error = %err, "push: connect failed"),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "push: reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("push: stopped");
    }

    /// Returns `Ok(true)` once an established connection ends, `Ok(false)`
    /// when cancelled while connected.
    async fn read_until_closed(
        &self,
        store: &ConversationStore,
        cancel: &CancellationToken,
        reconnecting: bool,
    ) -> Result<bool> {
        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "x-access-token",
            HeaderValue::from_str(&self.token).context("token is not a valid header value")?,
        );
        let (stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.url))?;
        info!(url = %self.url, "push: connected");
        if reconnecting {
            if let Err(err) = dispatch(store, TransportEvent::Reconnected).await {
                warn!(error = %err, "push: reconnect refresh failed");
            }
        }

        let (_, mut reader) = stream.split();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(event) => {
                        if let Err(err) = dispatch(store, TransportEvent::Push(event)).await {
                            warn!(error = %err, "push: failed to apply event");
                        }
                    }
                    Err(err) => warn!(error = %err, "push: dropping frame"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(true),
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "push: read failed");
                    return Ok(true);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;

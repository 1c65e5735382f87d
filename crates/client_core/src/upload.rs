use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client};
use shared::{
    domain::AttachmentKind,
    error::ApiError,
    protocol::{AttachmentPayload, UploadResponse},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::ClientError;

/// One in-flight file transfer. `start` resolves to the stored attachment;
/// `abort` asks the transport to stop without waiting for it to comply.
#[async_trait]
pub trait UploadRequest: Send + Sync {
    fn filename(&self) -> &str;
    fn mime_type(&self) -> &str;
    async fn start(&self) -> Result<AttachmentPayload>;
    fn abort(&self);
}

/// Resolves the transfers one after another. The first failure aborts the
/// run and whatever already completed is discarded by the caller.
pub async fn upload_sequentially(
    requests: &[Arc<dyn UploadRequest>],
) -> Result<Vec<AttachmentPayload>> {
    let mut attachments = Vec::with_capacity(requests.len());
    for request in requests {
        debug!(filename = request.filename(), "upload: starting transfer");
        let attachment = request.start().await?;
        attachments.push(attachment);
    }
    Ok(attachments)
}

pub struct HttpUploadRequest {
    http: Client,
    base_url: Url,
    token: String,
    filename: String,
    mime_type: String,
    bytes: Vec<u8>,
    cancel: CancellationToken,
}

impl HttpUploadRequest {
    pub fn new(
        http: Client,
        base_url: Url,
        token: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes,
            cancel: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::from_mime(&self.mime_type)
    }

    fn endpoint(&self) -> Result<Url> {
        let path = format!("api/attachments/upload/{}", self.kind().upload_path());
        self.base_url
            .join(&path)
            .with_context(|| format!("invalid upload url for {path}"))
    }

    async fn transfer(&self) -> Result<AttachmentPayload> {
        let url = self.endpoint()?;
        let part = multipart::Part::bytes(self.bytes.clone())
            .file_name(self.filename.clone())
            .mime_str(&self.mime_type)
            .with_context(|| format!("invalid mime type '{}'", self.mime_type))?;
        let form = multipart::Form::new().part("attachment", part);

        let response = self
            .http
            .post(url.clone())
            .header("x-access-token", &self.token)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let source = ApiError::from_response(status.as_u16(), &body);
            return Err(ClientError::UploadFailed {
                filename: self.filename.clone(),
                reason: source.to_string(),
            }
            .into());
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .with_context(|| format!("invalid upload response from {url}"))?;
        Ok(uploaded.data)
    }
}

#[async_trait]
impl UploadRequest for HttpUploadRequest {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    async fn start(&self) -> Result<AttachmentPayload> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::UploadCancelled.into());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(filename = %self.filename, "upload: transfer aborted");
                Err(ClientError::UploadCancelled.into())
            }
            result = self.transfer() => result,
        }
    }

    fn abort(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;

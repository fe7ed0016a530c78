use std::path::Path;

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use crate::chat::AttachmentUploader;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::models::{Attachment, AttachmentKind};

/// A binary payload handed to the uploader. Size and type policy are the
/// server's business; this layer only moves bytes.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub data: Vec<u8>,
    pub file_name: String,
    pub mime: String,
}

impl AttachmentUpload {
    pub fn new(data: Vec<u8>, file_name: impl Into<String>, mime: impl Into<String>) -> Self {
        AttachmentUpload {
            data,
            file_name: file_name.into(),
            mime: mime.into(),
        }
    }

    /// Read a payload from disk, guessing the MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self, ChatError> {
        let data = std::fs::read(path)
            .map_err(|e| ChatError::UploadFailed(format!("reading {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment")
            .to_string();
        let mime = guess_mime(&file_name).to_string();
        Ok(AttachmentUpload {
            data,
            file_name,
            mime,
        })
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

fn guess_mime(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Production uploader. Ships the payload as multipart form data and hands
/// back the reference the message will carry. No retry; a failure surfaces
/// before anything optimistic exists.
pub struct HttpUploader {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl HttpUploader {
    pub fn new(config: &ChatConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::UploadFailed(format!("building http client: {}", e)))?;
        Ok(HttpUploader {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponseDto {
    url: String,
}

#[async_trait]
impl AttachmentUploader for HttpUploader {
    async fn upload(&self, upload: AttachmentUpload) -> Result<Attachment, ChatError> {
        let url = format!("{}/api/chat/upload/", self.api_base);
        let kind = if upload.is_image() {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        };
        let name = upload.file_name.clone();

        let part = reqwest::multipart::Part::bytes(upload.data)
            .file_name(upload.file_name)
            .mime_str(&upload.mime)
            .map_err(|e| ChatError::UploadFailed(format!("invalid mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::UploadFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ChatError::Unauthorized(format!("{} for {}", status, url)));
        }
        if !status.is_success() {
            return Err(ChatError::UploadFailed(format!(
                "unexpected status {}",
                status
            )));
        }

        let reference: UploadResponseDto = response
            .json()
            .await
            .map_err(|e| ChatError::UploadFailed(format!("decoding upload response: {}", e)))?;
        debug!("uploaded {} as {}", name, reference.url);
        Ok(Attachment {
            url: reference.url,
            kind,
            name: Some(name),
        })
    }
}

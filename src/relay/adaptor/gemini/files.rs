//! # Gemini 文件上传
//!
//! 多媒体与大图通过可续传上传接口换取文件 URI；同一 (模型, URL) 在有效期内复用

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use super::model::{FileData, RemoteFile, UploadResponse};
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::adaptor::AdaptorDeps;
use crate::relay::meta::RelayMeta;
use crate::{ldebug, linfo};

const STATE_PROCESSING: &str = "PROCESSING";
const STATE_ACTIVE: &str = "ACTIVE";
const MAX_STATE_POLLS: usize = 10;

/// 文件表中的规范化 URL：http(s) 地址原样保存，其余（data URL）取 md5
#[must_use]
pub fn canonical_url(url: &str) -> String {
    if url.starts_with("http") {
        url.to_string()
    } else {
        format!("{:x}", md5::compute(url.as_bytes()))
    }
}

fn upload_error(message: impl Into<String>) -> RelayError {
    RelayError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        message,
        "relay_error",
        "upload_file_failed",
    )
}

/// 上传器；`poll_interval` 为处理中状态的轮询间隔
#[derive(Debug, Clone)]
pub struct FileUploader {
    deps: AdaptorDeps,
    poll_interval: Duration,
}

impl FileUploader {
    #[must_use]
    pub const fn new(deps: AdaptorDeps, poll_interval: Duration) -> Self {
        Self { deps, poll_interval }
    }

    /// 取得 URL 对应的文件引用，必要时上传；成功后记入 `meta.hints.file_uri`
    pub async fn resolve(&self, meta: &mut RelayMeta, url: &str) -> Result<FileData, RelayError> {
        let canonical = canonical_url(url);
        let cached = self
            .deps
            .repo
            .file_by_model_url(&meta.actual_model, &canonical)
            .await
            .map_err(|e| RelayError::wrap(e, "get_old_file_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        if let Some(file) = cached {
            ldebug!(&meta.request_id, LogStage::UpstreamRequest, LogComponent::Media, "file_cache_hit", "复用已上传文件", file_id = %file.file_id);
            meta.hints.file_uri = Some(file.file_id.clone());
            return Ok(FileData {
                mime_type: file.mime_type,
                file_uri: file.file_id,
            });
        }

        let media = self
            .deps
            .media
            .fetch(url)
            .await
            .map_err(|e| RelayError::wrap(e, "get_media_failed", StatusCode::BAD_REQUEST))?;
        let remote = self.upload(meta, &media.mime_type, media.data.to_vec()).await?;
        let remote = self.wait_active(meta, remote).await?;
        self.deps
            .repo
            .insert_file(&meta.actual_model, &canonical, &remote.uri, &media.mime_type)
            .await
            .map_err(|e| RelayError::wrap(e, "save_file_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        linfo!(&meta.request_id, LogStage::UpstreamRequest, LogComponent::Media, "file_uploaded", "文件已上传", channel_id = meta.channel_id, file_uri = %remote.uri);
        meta.hints.file_uri = Some(remote.uri.clone());
        Ok(FileData {
            mime_type: media.mime_type,
            file_uri: remote.uri,
        })
    }

    async fn upload(&self, meta: &RelayMeta, mime_type: &str, data: Vec<u8>) -> Result<RemoteFile, RelayError> {
        let client = &self.deps.clients.gemini;
        let start = client
            .post(format!("{}/upload/v1beta/files", meta.base_url))
            .header("x-goog-api-key", &meta.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": uuid::Uuid::new_v4().simple().to_string() } }))
            .send()
            .await
            .map_err(|e| RelayError::wrap(e, "upload_file_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        if !start.status().is_success() {
            return Err(upload_error(format!("upload file error: status {}", start.status())));
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| upload_error("upload file error: missing upload url"))?;

        let finish = client
            .post(upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data)
            .send()
            .await
            .map_err(|e| RelayError::wrap(e, "upload_file_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        if !finish.status().is_success() {
            return Err(upload_error(format!("upload file error: status {}", finish.status())));
        }
        let uploaded: UploadResponse = finish
            .json()
            .await
            .map_err(|e| RelayError::wrap(e, "upload_file_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        Ok(uploaded.file)
    }

    async fn wait_active(&self, meta: &RelayMeta, mut file: RemoteFile) -> Result<RemoteFile, RelayError> {
        let mut polls = 0;
        while file.state == STATE_PROCESSING {
            if polls >= MAX_STATE_POLLS {
                return Err(upload_error("Error: getting file state but timeout"));
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
            file = self
                .deps
                .clients
                .gemini
                .get(format!("{}/v1beta/{}", meta.base_url, file.name))
                .header("x-goog-api-key", &meta.api_key)
                .send()
                .await
                .map_err(|e| RelayError::wrap(e, "get_file_state_failed", StatusCode::INTERNAL_SERVER_ERROR))?
                .json()
                .await
                .map_err(|e| RelayError::wrap(e, "get_file_state_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
        }
        if !file.state.is_empty() && file.state != STATE_ACTIVE {
            return Err(upload_error(format!(
                "state {}: we can't process your file because it's failed when upload to Google server, you should check your files if it's legally",
                file.state
            )));
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_url() {
        assert_eq!(canonical_url("https://x/a.mp4"), "https://x/a.mp4");
        let hashed = canonical_url("data:image/png;base64,AAAA");
        assert_eq!(hashed.len(), 32);
        assert_eq!(hashed, canonical_url("data:image/png;base64,AAAA"));
    }
}

//! # 上游 HTTP 客户端池与媒体拉取
//!
//! 进程内共享的几类客户端：默认中继、IPv4 直连、用户内容、5 秒探测、Gemini 长超时

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Proxy};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, KvStore};
use crate::config::RelayConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// 单张图片上限
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;
/// 媒体元数据缓存时长
const MEDIA_CACHE_TTL: Duration = Duration::from_secs(600);
const HEAD_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// 上游客户端集合
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub relay: Client,
    pub ipv4: Client,
    pub user_content: Client,
    pub head_check: Client,
    pub gemini: Client,
}

fn builder_with_proxy(proxy: Option<&str>, name: &str) -> Result<reqwest::ClientBuilder> {
    let builder = Client::builder();
    match proxy.filter(|p| !p.is_empty()) {
        Some(url) => {
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Relay,
                "http_client_proxy",
                "HTTP 客户端使用代理",
                client = name,
                proxy = url
            );
            let proxy = Proxy::all(url)
                .map_err(|e| ProxyError::config_with_source(format!("{name} 代理地址无效: {url}"), e))?;
            Ok(builder.proxy(proxy))
        }
        None => Ok(builder),
    }
}

fn with_timeout(builder: reqwest::ClientBuilder, seconds: u64) -> reqwest::ClientBuilder {
    if seconds == 0 {
        builder
    } else {
        builder.timeout(Duration::from_secs(seconds))
    }
}

fn build(builder: reqwest::ClientBuilder, name: &str) -> Result<Client> {
    builder
        .build()
        .map_err(|e| ProxyError::server_init_with_source(format!("创建 {name} 客户端失败"), e))
}

impl HttpClients {
    /// 按中继配置构建；代理地址无效为致命错误
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let relay_proxy = config.proxy.as_deref();
        let relay = build(
            with_timeout(builder_with_proxy(relay_proxy, "relay")?, config.timeout),
            "relay",
        )?;
        let ipv4_proxy = config
            .ipv4_proxy
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(relay_proxy);
        let ipv4 = build(builder_with_proxy(ipv4_proxy, "ipv4")?, "ipv4")?;
        let user_content = build(
            with_timeout(
                builder_with_proxy(config.user_content_proxy.as_deref(), "user_content")?,
                config.user_content_timeout,
            ),
            "user_content",
        )?;
        let head_check = build(
            builder_with_proxy(relay_proxy, "head_check")?.timeout(HEAD_CHECK_TIMEOUT),
            "head_check",
        )?;
        let gemini = build(
            with_timeout(builder_with_proxy(relay_proxy, "gemini")?, config.gemini_timeout),
            "gemini",
        )?;
        Ok(Self {
            relay,
            ipv4,
            user_content,
            head_check,
            gemini,
        })
    }

    /// 用户提供的媒体地址：字面 IP 走 IPv4 客户端，其余走用户内容客户端
    #[must_use]
    pub fn media_client(&self, url: &str) -> &Client {
        let is_ip = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).parse::<IpAddr>().is_ok()))
            .unwrap_or(false);
        if is_ip { &self.ipv4 } else { &self.user_content }
    }
}

/// 拉取到的媒体
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaData {
    pub mime_type: String,
    pub data: Bytes,
}

impl MediaData {
    #[must_use]
    pub fn base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

/// 缓存在 `media_url:<md5>` 的元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaCache {
    pub is_media: bool,
    pub content_type: String,
}

/// 归一化常见的音频类型
fn normalize_mime(content_type: &str, url: &str) -> String {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "audio/mpeg" => "audio/mp3".to_string(),
        "audio/x-wav" => "audio/wav".to_string(),
        "audio/x-flac" => "audio/flac".to_string(),
        m if m.contains("octet-stream") || m.is_empty() => {
            let path = url.split('?').next().unwrap_or_default().to_ascii_lowercase();
            let guessed = [
                (".mp4", "video/mp4"),
                (".mp3", "audio/mp3"),
                (".png", "image/png"),
                (".jpg", "image/jpeg"),
                (".jpeg", "image/jpeg"),
                (".webp", "image/webp"),
                (".pdf", "application/pdf"),
            ]
            .iter()
            .find(|(ext, _)| path.ends_with(ext))
            .map(|(_, mime)| (*mime).to_string());
            guessed.unwrap_or(mime)
        }
        _ => mime,
    }
}

/// 解析 `data:<mime>;base64,<payload>`
pub fn decode_data_url(url: &str) -> Result<MediaData> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| ProxyError::validation("不是 data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| ProxyError::validation("data URL 格式错误"))?;
    let mime_type = header.split(';').next().unwrap_or_default().to_string();
    let data = STANDARD
        .decode(payload.trim())
        .map_err(|e| ProxyError::validation_with_source("data URL 不是合法的 base64", e))?;
    crate::ensure!(
        data.len() <= MAX_IMAGE_BYTES,
        Validation,
        "image size exceeds 20MB limit"
    );
    Ok(MediaData {
        mime_type: if mime_type.is_empty() {
            "image/png".to_string()
        } else {
            mime_type
        },
        data: Bytes::from(data),
    })
}

/// 用户媒体拉取器
#[derive(Debug, Clone)]
pub struct MediaFetcher {
    clients: Arc<HttpClients>,
    kv: Arc<KvStore>,
}

impl MediaFetcher {
    #[must_use]
    pub const fn new(clients: Arc<HttpClients>, kv: Arc<KvStore>) -> Self {
        Self { clients, kv }
    }

    fn is_media_extension(url: &str) -> bool {
        const EXTS: [&str; 18] = [
            "mp4", "mov", "mpeg", "mpg", "webm", "wmv", "3gpp", "avi", "x-flv", "pdf", "txt",
            "csv", "wav", "mp3", "aiff", "aac", "ogg", "flac",
        ];
        let lower = url.to_ascii_lowercase();
        EXTS.iter().any(|ext| lower.ends_with(ext))
    }

    /// 拉取 URL 或解码 data URL，超过 20 MiB 报错
    pub async fn fetch(&self, url: &str) -> Result<MediaData> {
        if url.starts_with("data:") {
            return decode_data_url(url);
        }
        let response = match self.clients.media_client(url).get(url).send().await {
            Ok(response) => response,
            Err(first) => {
                ldebug!(
                    "system",
                    LogStage::UpstreamRequest,
                    LogComponent::Media,
                    "media_fetch_retry_ipv4",
                    "媒体拉取失败，改用 IPv4 客户端重试",
                    error = %first
                );
                self.clients.ipv4.get(url).send().await.map_err(|e| {
                    ProxyError::network_with_source(format!("failed to get this url : {url}"), e)
                })?
            }
        };
        let status = response.status();
        crate::ensure!(
            status.is_success(),
            Network,
            format!("failed to get this url : {url}, status : {status}")
        );
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if let Some(length) = response.content_length() {
            crate::ensure!(
                usize::try_from(length).unwrap_or(usize::MAX) <= MAX_IMAGE_BYTES,
                Validation,
                "image size exceeds 20MB limit"
            );
        }

        let mut data = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            crate::ensure!(
                data.len() + chunk.len() <= MAX_IMAGE_BYTES,
                Validation,
                "image size exceeds 20MB limit"
            );
            data.extend_from_slice(&chunk);
        }
        let mime_type = normalize_mime(&content_type, url);
        self.remember(url, &mime_type).await;
        Ok(MediaData {
            mime_type,
            data: Bytes::from(data),
        })
    }

    async fn remember(&self, url: &str, content_type: &str) {
        let digest = format!("{:x}", md5::compute(url.as_bytes()));
        let key = CacheKey::MediaUrl(&digest).build();
        let entry = MediaCache {
            is_media: !content_type.starts_with("image/") && !content_type.is_empty(),
            content_type: content_type.to_string(),
        };
        if let Err(e) = self.kv.set_json(&key, &entry, Some(MEDIA_CACHE_TTL)).await {
            ldebug!("system", LogStage::Cache, LogComponent::Media, "media_cache_write_failed", "写入媒体缓存失败", error = %e);
        }
    }

    /// 是否为非图片的多媒体（视频、音频、文档）
    pub async fn is_media_url(&self, url: &str) -> Result<bool> {
        if !url.starts_with("http") {
            return Ok(false);
        }
        if Self::is_media_extension(url) {
            return Ok(true);
        }
        let digest = format!("{:x}", md5::compute(url.as_bytes()));
        let key = CacheKey::MediaUrl(&digest).build();
        if let Ok(Some(cache)) = self.kv.get_json::<MediaCache>(&key).await {
            return Ok(cache.is_media);
        }
        let response = self
            .clients
            .head_check
            .head(url)
            .send()
            .await
            .map_err(|e| ProxyError::network_with_source(format!("failed to get this url : {url}"), e))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mime = normalize_mime(&content_type, url);
        self.remember(url, &mime).await;
        Ok(!mime.starts_with("image/") && Self::is_media_extension(&mime))
    }
}

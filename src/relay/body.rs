//! # 请求体缓存与表单解析
//!
//! 请求体只读取一次，保存在请求扩展中；每次重试都从同一份字节重新解析

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request};
use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tower::{Layer, ServiceExt, service_fn};

use super::client::MAX_IMAGE_BYTES;
use crate::error::{ProxyError, Result};

/// 缓存的原始请求体
#[derive(Debug, Clone, Default)]
pub struct CachedBody(pub Bytes);

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

#[must_use]
pub fn is_multipart(headers: &HeaderMap) -> bool {
    content_type(headers).starts_with("multipart/form-data")
}

/// 按内容类型解析 JSON 请求体
pub fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::validation_with_source(format!("请求体解析失败: {e}"), e))
}

/// 表单中的一个字段
#[derive(Debug, Clone, Default)]
pub struct FormField {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormField {
    #[must_use]
    pub const fn is_file(&self) -> bool {
        self.file_name.is_some()
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// 文件字段转 data URL；超过 20 MiB 报错
    pub fn to_data_url(&self) -> Result<String> {
        crate::ensure!(
            self.data.len() <= MAX_IMAGE_BYTES,
            Validation,
            "image size exceeds 20MB limit"
        );
        let mime = self
            .content_type
            .clone()
            .filter(|c| !c.is_empty() && c != "application/octet-stream")
            .unwrap_or_else(|| "image/png".to_string());
        Ok(format!("data:{mime};base64,{}", STANDARD.encode(&self.data)))
    }
}

/// 解析后的 multipart 表单
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub fields: Vec<FormField>,
}

impl MultipartForm {
    /// 从缓存字节解析；需要原请求的 `Content-Type`（含 boundary）
    pub async fn parse(headers: &HeaderMap, body: &Bytes) -> Result<Self> {
        let mut request = Request::new(Body::from(body.clone()));
        if let Some(value) = headers.get(header::CONTENT_TYPE) {
            request.headers_mut().insert(header::CONTENT_TYPE, value.clone());
        }
        // 请求体已整体缓存，解析时不再套默认大小限制
        let extract = service_fn(|request: Request| Multipart::from_request(request, &()));
        let mut multipart = DefaultBodyLimit::disable()
            .layer(extract)
            .oneshot(request)
            .await
            .map_err(|e| ProxyError::validation(format!("multipart 解析失败: {e}")))?;
        let mut fields = Vec::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ProxyError::validation(format!("multipart 解析失败: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| ProxyError::validation(format!("读取表单字段失败: {e}")))?;
            fields.push(FormField {
                name,
                file_name,
                content_type,
                data,
            });
        }
        Ok(Self { fields })
    }

    /// 第一个同名文本字段
    #[must_use]
    pub fn text(&self, name: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|f| f.name == name && !f.is_file())
            .map(FormField::text)
    }

    /// 整数字段；格式错误视为缺省
    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        self.text(name).and_then(|v| v.trim().parse().ok())
    }

    /// 同名文件字段（兼容 `image[]`）
    pub fn files<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormField> + 'a {
        self.fields.iter().filter(move |f| {
            f.is_file() && (f.name == name || f.name.strip_suffix("[]") == Some(name))
        })
    }
}

/// 从缓存的请求体中取出模型名；空请求体返回空串
pub async fn request_model(headers: &HeaderMap, body: &Bytes) -> Result<String> {
    if body.is_empty() {
        return Ok(String::new());
    }
    let kind = content_type(headers);
    if kind.starts_with("multipart/form-data") {
        let form = MultipartForm::parse(headers, body).await?;
        return Ok(form.text("model").unwrap_or_default());
    }
    if kind.starts_with("application/x-www-form-urlencoded") {
        return Ok(url::form_urlencoded::parse(body)
            .find(|(k, _)| k == "model")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default());
    }
    let value: serde_json::Value = parse_json(body)?;
    Ok(value["model"].as_str().unwrap_or_default().to_string())
}

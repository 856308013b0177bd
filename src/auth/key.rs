//! # API Key 解析
//!
//! 解析 `Authorization: Bearer sk-<key>[-<channelId>]` 并提供脱敏工具

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

/// 解析后的调用方凭证
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedKey {
    /// 去掉 `Bearer ` 后的完整值，负缓存以此为键
    pub api_key: String,
    /// 数据库中的令牌 key（无 `sk-` 前缀、无渠道后缀）
    pub key: String,
    /// 管理员指定的渠道 ID
    pub channel_id: Option<String>,
}

/// 认证工具
pub struct AuthUtils;

impl AuthUtils {
    /// 从请求头解析调用方凭证
    ///
    /// # 参数
    /// - `headers`: HTTP请求头
    ///
    /// # 返回
    /// 缺少请求头时各字段为空串，由令牌校验给出 "no key provided"
    #[must_use]
    pub fn parse_authorization(headers: &HeaderMap) -> ParsedKey {
        let raw = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Self::parse_key(raw)
    }

    /// 解析 `Bearer sk-<key>[-<channelId>]`
    #[must_use]
    pub fn parse_key(raw: &str) -> ParsedKey {
        let api_key = raw.strip_prefix("Bearer ").unwrap_or(raw).trim().to_string();
        let stripped = api_key.strip_prefix("sk-").unwrap_or(&api_key);
        let mut parts = stripped.split('-');
        let key = parts.next().unwrap_or_default().to_string();
        let channel_id = parts.next().map(str::to_string);
        ParsedKey {
            api_key,
            key,
            channel_id,
        }
    }

    /// 脱敏 key，格式: "abc***wxyz"
    ///
    /// # 参数
    /// - `key`: 原始 key
    ///
    /// # 返回
    /// 保留前 3 位与后 4 位；过短的 key 只保留首字符
    #[must_use]
    pub fn mask_key(key: &str) -> String {
        let chars: Vec<char> = key.chars().collect();
        if chars.len() < 8 {
            let head: String = chars.iter().take(1).collect();
            return format!("{head}***");
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}***{tail}")
    }
}

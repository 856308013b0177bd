//! # 缓存键命名规范

use std::fmt;

/// 缓存键类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey<'a> {
    /// `token:{key}`
    Token(&'a str),
    /// `user_quota:{id}`
    UserQuota(i32),
    /// `user_group:{id}`
    UserGroup(i32),
    /// `user_enabled:{id}`
    UserEnabled(i32),
    /// `group_models:{group}`
    GroupModels(&'a str),
    /// `media_url:{md5}`
    MediaUrl(&'a str),
    /// `Auth_Error:{api_key}`
    AuthError(&'a str),
    /// `rateLimit:{mark}_{subject}`
    RateLimit { mark: &'a str, subject: &'a str },
    /// `send_mail:{md5(subject)}`
    SendMail(&'a str),
    /// 渠道索引重建锁
    ChannelGenerateLock,
}

impl CacheKey<'_> {
    /// 生成缓存键字符串
    #[must_use]
    pub fn build(&self) -> String {
        match self {
            Self::Token(key) => format!("token:{key}"),
            Self::UserQuota(id) => format!("user_quota:{id}"),
            Self::UserGroup(id) => format!("user_group:{id}"),
            Self::UserEnabled(id) => format!("user_enabled:{id}"),
            Self::GroupModels(group) => format!("group_models:{group}"),
            Self::MediaUrl(digest) => format!("media_url:{digest}"),
            Self::AuthError(api_key) => format!("Auth_Error:{api_key}"),
            Self::RateLimit { mark, subject } => format!("rateLimit:{mark}_{subject}"),
            Self::SendMail(subject) => format!("send_mail:{:x}", md5::compute(subject.as_bytes())),
            Self::ChannelGenerateLock => "CHANNEL_GENERATE_LOCK".to_string(),
        }
    }
}

impl fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(CacheKey::Token("abc").build(), "token:abc");
        assert_eq!(CacheKey::UserQuota(7).build(), "user_quota:7");
        assert_eq!(CacheKey::AuthError("sk-bad").build(), "Auth_Error:sk-bad");
        assert_eq!(
            CacheKey::RateLimit { mark: "RALAY", subject: "abc_gpt-4o" }.build(),
            "rateLimit:RALAY_abc_gpt-4o"
        );
        assert_eq!(CacheKey::ChannelGenerateLock.build(), "CHANNEL_GENERATE_LOCK");
        let mail = CacheKey::SendMail("额度提醒").build();
        assert!(mail.starts_with("send_mail:"));
        assert_eq!(mail.len(), "send_mail:".len() + 32);
    }
}

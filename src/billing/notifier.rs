//! # 邮件通知
//!
//! 通知发送抽象；默认实现只写日志并保留最近的消息

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{CacheKey, KvStore};
use crate::error::Result;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 同一收件人同一主题的去重窗口
const SEND_MAIL_DEDUP: Duration = Duration::from_secs(60);
const RECENT_CAPACITY: usize = 128;

/// 一封已发送的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub content: String,
}

/// 通知发送方
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    async fn send(&self, to: &str, subject: &str, content: &str) -> Result<()>;
}

/// 写日志的通知实现
#[derive(Debug, Default)]
pub struct LogNotifier {
    recent: Mutex<VecDeque<Mail>>,
}

impl LogNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 最近发送的消息，旧的在前
    #[must_use]
    pub fn sent(&self) -> Vec<Mail> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, content: &str) -> Result<()> {
        linfo!(
            "system",
            LogStage::Billing,
            LogComponent::Notifier,
            "mail_sent",
            "发送通知",
            to = to,
            subject = subject,
            content = content
        );
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() >= RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(Mail {
            to: to.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }
}

/// 去重发送：窗口内已发送过则跳过，返回是否真正发送
pub async fn send_once(
    kv: &KvStore,
    notifier: &dyn Notifier,
    to: &str,
    subject: &str,
    content: &str,
) -> Result<bool> {
    if to.is_empty() {
        return Ok(false);
    }
    let key = CacheKey::SendMail(&format!("{to}:{subject}")).build();
    if !kv.set_nx(&key, "1", Some(SEND_MAIL_DEDUP)).await? {
        return Ok(false);
    }
    notifier.send(to, subject, content).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_once_dedups_within_window() {
        let kv = KvStore::memory();
        let notifier = LogNotifier::new();

        assert!(send_once(&kv, &notifier, "a@x.io", "Hi", "one").await.unwrap());
        assert!(!send_once(&kv, &notifier, "a@x.io", "Hi", "two").await.unwrap());
        assert!(send_once(&kv, &notifier, "b@x.io", "Hi", "three").await.unwrap());

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].content, "one");
        assert_eq!(sent[1].to, "b@x.io");
    }

    #[tokio::test]
    async fn test_send_once_skips_empty_recipient() {
        let kv = KvStore::memory();
        let notifier = LogNotifier::new();
        assert!(!send_once(&kv, &notifier, "", "Hi", "x").await.unwrap());
        assert!(notifier.sent().is_empty());
    }
}

use pretty_assertions::assert_eq;

use super::*;
use crate::channel::{ChannelKind, ChannelStatus};
use crate::testing::fixtures::{ChannelRow, group_row, token_row, user_row};
use crate::testing::memory_repository;

#[test]
fn test_split_list_trims_and_drops_empty() {
    assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
    assert!(split_list("").is_empty());
}

#[tokio::test]
async fn test_channel_insert_fans_out_abilities() {
    let repo = memory_repository().await;
    let mut row = ChannelRow::new(ChannelKind::OpenAi, "http://up", &["gpt-4o", "gpt-4o-mini"]);
    row.group = "default,vip".to_string();
    let channel = repo.insert_channel(row.active_model()).await.unwrap();

    let abilities = repo.enabled_abilities().await.unwrap();
    assert_eq!(abilities.len(), 4);
    assert!(abilities.iter().all(|a| a.channel_id == channel.id));

    repo.update_channel_status(channel.id, ChannelStatus::AutoDisabled.code(), Some("bad key"))
        .await
        .unwrap();
    assert!(repo.enabled_abilities().await.unwrap().is_empty());
    let stored = repo.channel_by_id(channel.id).await.unwrap().unwrap();
    assert_eq!(stored.disable_reason.as_deref(), Some("bad key"));

    repo.update_channel_used_quota(channel.id, 250).await.unwrap();
    repo.update_channel_used_quota(channel.id, 50).await.unwrap();
    let stored = repo.channel_by_id(channel.id).await.unwrap().unwrap();
    assert_eq!(stored.used_quota, 300);
}

#[tokio::test]
async fn test_token_quota_shifts_and_rejects_negative() {
    let repo = memory_repository().await;
    let user = repo.insert_user(user_row("dave", "default", 1_000)).await.unwrap();
    let token = repo.insert_token(token_row(user.id, "sk-dave", 500)).await.unwrap();

    repo.decrease_token_quota(token.id, 200).await.unwrap();
    repo.increase_token_quota(token.id, 50).await.unwrap();
    let stored = repo.token_by_id(token.id).await.unwrap().unwrap();
    assert_eq!(stored.remain_quota, 350);
    assert_eq!(stored.used_quota, 150);

    assert!(repo.decrease_token_quota(token.id, -1).await.is_err());
    assert_eq!(repo.token_by_key("sk-dave").await.unwrap().unwrap().id, token.id);
}

#[tokio::test]
async fn test_user_quota_and_usage_counters() {
    let repo = memory_repository().await;
    let user = repo.insert_user(user_row("erin", "vip", 1_000)).await.unwrap();

    repo.decrease_user_quota(user.id, 300).await.unwrap();
    repo.increase_user_quota(user.id, 100).await.unwrap();
    repo.update_user_used_quota_and_request_count(user.id, 200, 1)
        .await
        .unwrap();

    assert_eq!(repo.user_quota(user.id).await.unwrap(), 800);
    assert_eq!(repo.user_group(user.id).await.unwrap(), "vip");
    assert!(repo.user_enabled(user.id).await.unwrap());
    let stored = repo.user_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.used_quota, 200);
    assert_eq!(stored.request_count, 1);
    assert!(repo.user_quota(user.id + 100).await.is_err());
}

#[tokio::test]
async fn test_logs_by_token_window() {
    let repo = memory_repository().await;
    for (token_id, model) in [(1, "gpt-4o"), (1, "gpt-4o-mini"), (2, "gemini-1.5-pro")] {
        repo.record_consume_log(UsageLogRecord {
            user_id: 1,
            token_id,
            model_name: model.to_string(),
            quota: 10,
            ..UsageLogRecord::default()
        })
        .await
        .unwrap();
    }
    let now = chrono::Utc::now().timestamp();
    let rows = repo.logs_by_token(1, now - 60, now + 60).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.log_type == LOG_TYPE_CONSUME));
    assert!(repo.logs_by_token(1, now + 60, now + 120).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_files_expire() {
    let repo = memory_repository().await;
    repo.insert_file("gemini-1.5-pro", "https://x/a.png", "files/a", "image/png")
        .await
        .unwrap();
    let now = chrono::Utc::now().timestamp();
    assert_eq!(repo.delete_expired_files(now).await.unwrap(), 0);
    assert_eq!(repo.delete_expired_files(now + FILE_TTL_SECS + 1).await.unwrap(), 1);
    assert!(
        repo.file_by_model_url("gemini-1.5-pro", "https://x/a.png")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_options_upsert_and_groups() {
    let repo = memory_repository().await;
    repo.upsert_option("RetryTimes", "2").await.unwrap();
    repo.upsert_option("RetryTimes", "4").await.unwrap();
    assert_eq!(
        repo.list_options().await.unwrap(),
        vec![("RetryTimes".to_string(), "4".to_string())]
    );

    let mut group = group_row("vip", 0.5, 3);
    group.models = sea_orm::Set("gpt-4o, gemini-1.5-pro".to_string());
    repo.insert_group(group).await.unwrap();
    assert_eq!(repo.group_models("vip").await.unwrap(), vec!["gpt-4o", "gemini-1.5-pro"]);
    assert!(repo.group_models("missing").await.unwrap().is_empty());
}

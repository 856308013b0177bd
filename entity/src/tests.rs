//! # 实体定义测试

use crate::{abilities, channels, tokens};
use sea_orm::Set;

#[test]
fn test_token_active_model() {
    let token = tokens::ActiveModel {
        key: Set("abc123".to_string()),
        user_id: Set(1),
        status: Set(1),
        expired_time: Set(-1),
        remain_quota: Set(1000),
        unlimited_quota: Set(false),
        ..Default::default()
    };

    assert_eq!(token.key.as_ref(), "abc123");
    assert_eq!(token.expired_time.as_ref(), &-1);
    assert_eq!(token.unlimited_quota.as_ref(), &false);
}

#[test]
fn test_channel_active_model() {
    let channel = channels::ActiveModel {
        name: Set("gemini-main".to_string()),
        channel_type: Set(24),
        priority: Set(10),
        models: Set("gemini-1.5-pro,gemini-1.5-flash".to_string()),
        group: Set("default".to_string()),
        ..Default::default()
    };

    assert_eq!(channel.channel_type.as_ref(), &24);
    assert_eq!(channel.models.as_ref().split(',').count(), 2);
}

#[test]
fn test_ability_primary_key_fields() {
    let ability = abilities::Model {
        group: "default".to_string(),
        model: "gpt-4o".to_string(),
        channel_id: 3,
        enabled: true,
        priority: 0,
    };
    let json = serde_json::to_value(&ability).unwrap();
    assert_eq!(json["channel_id"], 3);
    assert_eq!(json["group"], "default");
}

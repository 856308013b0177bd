//! # 渠道巡检
//!
//! 软限制停用与未激活渠道的自动补位

use std::collections::{BTreeMap, HashMap};

use entity::{channels, groups};

use super::ChannelMonitor;
use crate::channel::ChannelStatus;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 已用额度（折算美元）达到软限制
fn over_soft_limit(channel: &channels::Model, quota_per_unit: f64) -> bool {
    channel.soft_limit_usd > 0.0
        && quota_per_unit > 0.0
        && channel.used_quota as f64 / quota_per_unit >= channel.soft_limit_usd
}

/// 每个 `(类型, 分组)` 补足到目标数量时需要启用的未激活渠道
pub(crate) fn activation_plan(
    all: &[channels::Model],
    groups: &[groups::Model],
    default_active_num: i32,
) -> Vec<i32> {
    let targets: HashMap<&str, i32> = groups
        .iter()
        .map(|g| (g.name.as_str(), g.active_num))
        .collect();
    let mut buckets: BTreeMap<(i32, &str), (i32, Vec<i32>)> = BTreeMap::new();
    for channel in all {
        let bucket = buckets
            .entry((channel.channel_type, channel.group.as_str()))
            .or_default();
        match ChannelStatus::from_code(channel.status) {
            ChannelStatus::Enabled | ChannelStatus::Sleeping => bucket.0 += 1,
            ChannelStatus::Unactivated => bucket.1.push(channel.id),
            _ => {}
        }
    }

    let mut plan = Vec::new();
    for ((_, group), (active, mut pending)) in buckets {
        let target = targets
            .get(group)
            .copied()
            .filter(|n| *n > 0)
            .unwrap_or(default_active_num);
        let missing = usize::try_from(target - active).unwrap_or(0);
        pending.sort_unstable();
        plan.extend(pending.into_iter().take(missing));
    }
    plan
}

impl ChannelMonitor {
    /// 停用超出软限制的渠道，返回停用数量
    pub async fn close_soft_limit_channels(&self) -> Result<usize> {
        let quota_per_unit = self.options.snapshot().quota_per_unit;
        let mut closed = 0;
        for channel in self
            .repo
            .channels_with_status(ChannelStatus::Enabled.code())
            .await?
            .into_iter()
            .filter(|c| over_soft_limit(c, quota_per_unit))
        {
            let reason = format!(
                "超出软限制，软限制 {:.2} 美元，已使用 {:.2} 美元",
                channel.soft_limit_usd,
                channel.used_quota as f64 / quota_per_unit
            );
            match self
                .disable_as(channel.id, &channel.name, ChannelStatus::ManuallyDisabled, &reason)
                .await
            {
                Ok(()) => closed += 1,
                Err(e) => {
                    lwarn!("system", LogStage::BackgroundTask, LogComponent::Monitor, "soft_limit_close_failed", "软限制停用失败", channel_id = channel.id, error = %e);
                }
            }
        }
        Ok(closed)
    }

    /// 启用未激活渠道直到各 `(类型, 分组)` 达到目标活跃数
    pub async fn activate_channels(&self) -> Result<usize> {
        let default_active_num = self.options.snapshot().default_active_num;
        let all = self.repo.all_channels().await?;
        let groups = self.repo.all_groups().await?;
        let plan = activation_plan(&all, &groups, default_active_num);
        if plan.is_empty() {
            return Ok(0);
        }
        for id in &plan {
            self.repo
                .update_channel_status(*id, ChannelStatus::Enabled.code(), None)
                .await?;
        }
        self.channels.rebuild().await?;
        linfo!("system", LogStage::BackgroundTask, LogComponent::Monitor, "channels_activated", "已激活渠道", count = plan.len());
        Ok(plan.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::testing::TestHarness;
    use crate::testing::fixtures::{ChannelRow, group_row};

    fn row(id: i32, channel_type: i32, group: &str, status: ChannelStatus) -> channels::Model {
        channels::Model {
            id,
            channel_type,
            key: String::new(),
            status: status.code(),
            name: format!("c{id}"),
            weight: 0,
            created_time: 0,
            test_time: 0,
            response_time: 0,
            base_url: None,
            models: "gpt-4o".to_string(),
            group: group.to_string(),
            used_quota: 0,
            model_mapping: None,
            priority: 0,
            config: "{}".to_string(),
            system_prompt: None,
            soft_limit_usd: 0.0,
            rpm_limit: 0,
            dpm_limit: 0,
            tpm_limit: 0,
            disable_reason: None,
        }
    }

    #[test]
    fn test_activation_plan_fills_each_bucket() {
        let all = vec![
            row(1, 24, "default", ChannelStatus::Enabled),
            row(2, 24, "default", ChannelStatus::Unactivated),
            row(3, 24, "default", ChannelStatus::Unactivated),
            row(4, 24, "vip", ChannelStatus::Unactivated),
            row(5, 24, "vip", ChannelStatus::Unactivated),
            row(6, 1, "default", ChannelStatus::Sleeping),
            row(7, 1, "default", ChannelStatus::Unactivated),
        ];
        let groups = vec![groups::Model {
            id: 1,
            name: "default".to_string(),
            models: String::new(),
            ratio: String::new(),
            group_ratio: 1.0,
            active_num: 2,
            status: 1,
            created_time: 0,
        }];
        let plan = activation_plan(&all, &groups, 1);
        assert_eq!(plan, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_soft_limit_disables_channel() {
        let harness = TestHarness::new().await;
        let over = harness
            .seed_channel(
                ChannelRow::new(ChannelKind::OpenAi, "http://127.0.0.1:1", &["gpt-4o"])
                    .name("over")
                    .soft_limit(1.0, 600_000),
            )
            .await;
        let under = harness
            .seed_channel(
                ChannelRow::new(ChannelKind::OpenAi, "http://127.0.0.1:1", &["gpt-4o"])
                    .name("under")
                    .soft_limit(10.0, 600_000),
            )
            .await;

        let closed = harness.context.monitor.close_soft_limit_channels().await.unwrap();
        assert_eq!(closed, 1);
        let row = harness.context.repo.channel_by_id(over.id).await.unwrap().unwrap();
        assert_eq!(row.status, ChannelStatus::ManuallyDisabled.code());
        assert!(row.disable_reason.unwrap_or_default().starts_with("超出软限制"));
        assert!(harness.context.channels.get(over.id).is_none());
        assert!(harness.context.channels.get(under.id).is_some());
    }

    #[tokio::test]
    async fn test_activation_enables_unactivated_channel() {
        let harness = TestHarness::new().await;
        harness
            .context
            .repo
            .insert_group(group_row("default", 1.0, 1))
            .await
            .unwrap();
        let pending = harness
            .seed_channel(
                ChannelRow::new(ChannelKind::Gemini, "http://127.0.0.1:1", &["gemini-1.5-pro"])
                    .status(ChannelStatus::Unactivated),
            )
            .await;
        assert!(harness.context.channels.get(pending.id).is_none());

        let activated = harness.context.monitor.activate_channels().await.unwrap();
        assert_eq!(activated, 1);
        assert!(harness.context.channels.get(pending.id).is_some());
        assert_eq!(harness.context.monitor.activate_channels().await.unwrap(), 0);
    }
}

//! # 计费
//!
//! 预扣与结算、批量落库、令牌巡检与提醒通知

pub mod alerts;
pub mod batch;
pub mod notifier;
pub mod quota;

pub use alerts::{SweepReport, TokenSweeper};
pub use batch::{BatchKind, BatchUpdater};
pub use notifier::{LogNotifier, Mail, Notifier, send_once};
pub use quota::{PreConsumed, QuotaAccountant, UsageCharge, consume_log_content, text_quota};

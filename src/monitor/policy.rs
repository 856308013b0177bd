//! # 失败处理策略
//!
//! 根据上游错误判断禁用、休眠、删除文件以及是否换渠道重试

use axum::http::StatusCode;

use crate::channel::ChannelKind;
use crate::error::RelayError;

const DISABLE_TYPES: [&str; 4] = [
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

const DISABLE_CODES: [&str; 2] = ["invalid_api_key", "account_deactivated"];

const DISABLE_MESSAGES: [&str; 14] = [
    "your access was terminated",
    "violation of our policies",
    "your credit balance is too low",
    "you have reached your specified api usage limits",
    "organization has been disabled",
    "credit",
    "balance",
    "permission denied",
    "organization has been restricted",
    "已欠费",
    "quota exceeded for quota metric 'generate content api requests per minute'",
    "api key not found. please pass a valid api key",
    "api key expired. please renew the api key",
    "permission denied: consumer 'api_key:ai",
];

const SLEEP_MESSAGES: [&str; 3] = [
    "resource has been exhauste",
    "you exceeded your current quota",
    "e.g. check quota",
];

const DEL_FILE_MESSAGES: [&str; 3] = [
    "you do not have permission to access the file",
    "quota exceeded for quota metric 'generate content api requests per minute'",
    "permission denied: consumer 'api_key:ai",
];

fn message_matches(err: &RelayError, needles: &[&str]) -> bool {
    let lower = err.error.message.to_lowercase();
    needles.iter().any(|needle| lower.contains(needle))
}

/// 是否应自动禁用渠道；`enabled` 为全局开关
#[must_use]
pub fn should_disable(err: &RelayError, enabled: bool) -> bool {
    if !enabled {
        return false;
    }
    if err.status_code == StatusCode::UNAUTHORIZED {
        return true;
    }
    if DISABLE_TYPES.contains(&err.error.kind.as_str()) {
        return true;
    }
    if DISABLE_CODES.contains(&err.code_str()) {
        return true;
    }
    message_matches(err, &DISABLE_MESSAGES)
}

/// 仅 Gemini 渠道的配额耗尽触发休眠
#[must_use]
pub fn should_sleep(kind: ChannelKind, err: &RelayError) -> bool {
    kind == ChannelKind::Gemini && message_matches(err, &SLEEP_MESSAGES)
}

/// 已缓存的上传文件是否失效
#[must_use]
pub fn should_del_file(err: &RelayError) -> bool {
    message_matches(err, &DEL_FILE_MESSAGES)
}

/// 是否换渠道重试；指定渠道的请求从不重试
#[must_use]
pub fn should_retry(pinned: bool, status: StatusCode) -> bool {
    if pinned {
        return false;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return true;
    }
    !(status == StatusCode::BAD_REQUEST || status.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::Value;

    fn upstream(status: StatusCode, message: &str, kind: &str, code: &str) -> RelayError {
        let code = if code.is_empty() { Value::Null } else { Value::from(code) };
        RelayError::new(status, message, kind, code)
    }

    #[rstest]
    #[case(StatusCode::UNAUTHORIZED, "whatever", "", "", true)]
    #[case(StatusCode::FORBIDDEN, "nope", "permission_error", "", true)]
    #[case(StatusCode::BAD_REQUEST, "bad key", "", "invalid_api_key", true)]
    #[case(StatusCode::BAD_REQUEST, "Your credit balance is too low", "", "", true)]
    #[case(StatusCode::FORBIDDEN, "账户已欠费", "", "", true)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded", "server_error", "", false)]
    #[case(StatusCode::TOO_MANY_REQUESTS, "Resource has been exhausted", "", "", false)]
    fn test_should_disable(
        #[case] status: StatusCode,
        #[case] message: &str,
        #[case] kind: &str,
        #[case] code: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(should_disable(&upstream(status, message, kind, code), true), expected);
    }

    #[test]
    fn test_should_disable_respects_toggle() {
        let err = upstream(StatusCode::UNAUTHORIZED, "bad", "", "");
        assert!(!should_disable(&err, false));
    }

    #[test]
    fn test_should_sleep_only_for_gemini() {
        let err = upstream(StatusCode::TOO_MANY_REQUESTS, "Resource has been exhausted", "", "");
        assert!(should_sleep(ChannelKind::Gemini, &err));
        assert!(!should_sleep(ChannelKind::OpenAi, &err));
        let quota = upstream(StatusCode::TOO_MANY_REQUESTS, "You exceeded your current quota", "", "");
        assert!(should_sleep(ChannelKind::Gemini, &quota));
        let other = upstream(StatusCode::TOO_MANY_REQUESTS, "slow down", "", "");
        assert!(!should_sleep(ChannelKind::Gemini, &other));
    }

    #[test]
    fn test_should_del_file() {
        let err = upstream(
            StatusCode::FORBIDDEN,
            "You do not have permission to access the File abc",
            "",
            "",
        );
        assert!(should_del_file(&err));
        assert!(!should_del_file(&upstream(StatusCode::FORBIDDEN, "denied", "", "")));
    }

    #[rstest]
    #[case(false, StatusCode::TOO_MANY_REQUESTS, true)]
    #[case(false, StatusCode::BAD_GATEWAY, true)]
    #[case(false, StatusCode::BAD_REQUEST, false)]
    #[case(false, StatusCode::OK, false)]
    #[case(false, StatusCode::UNAUTHORIZED, true)]
    #[case(true, StatusCode::INTERNAL_SERVER_ERROR, false)]
    fn test_should_retry(#[case] pinned: bool, #[case] status: StatusCode, #[case] expected: bool) {
        assert_eq!(should_retry(pinned, status), expected);
    }
}

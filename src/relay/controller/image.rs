//! # 图片生成与编辑

use axum::http::StatusCode;
use axum::response::Response;
use serde_json::Value;

use super::{AttemptFailure, Charged, RelayRequest, Settlement, encode_body, finish, round_trip};
use crate::app::AppContext;
use crate::channel::Channel;
use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::relay::body::{MultipartForm, is_multipart, parse_json};
use crate::relay::mode::RelayMode;
use crate::relay::model::ImageRequest;
use crate::relay::ratio::{image_n_range, image_prompt_limit, image_size_ratio, model_ratio};
use crate::{ldebug, lwarn};

const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";
const DEFAULT_SIZE: &str = "1024x1024";

fn bad_request(message: &str, code: &str) -> RelayError {
    RelayError::wrap(message, code, StatusCode::BAD_REQUEST)
}

/// JSON 或 multipart 请求体转为 [`ImageRequest`]，并补齐缺省值
pub(super) async fn parse_request(request: &RelayRequest) -> Result<ImageRequest, RelayError> {
    let invalid = |e: crate::error::ProxyError| bad_request(&e.message(), "invalid_image_request");
    let mut image = if is_multipart(&request.headers) {
        let form = MultipartForm::parse(&request.headers, &request.body)
            .await
            .map_err(invalid)?;
        let mut images = Vec::new();
        for file in form.files("image") {
            images.push(file.to_data_url().map_err(invalid)?);
        }
        ImageRequest {
            model: form.text("model").unwrap_or_default(),
            prompt: form.text("prompt").unwrap_or_default(),
            n: form.int("n"),
            size: form.text("size").unwrap_or_default(),
            quality: form.text("quality").unwrap_or_default(),
            response_format: form.text("response_format").unwrap_or_default(),
            style: form.text("style").unwrap_or_default(),
            user: form.text("user").unwrap_or_default(),
            image: images,
        }
    } else {
        let mut value: Value = parse_json(&request.body).map_err(invalid)?;
        // 单张图片允许直接传字符串
        if let Some(single) = value.get("image").and_then(Value::as_str).map(str::to_string) {
            value["image"] = Value::Array(vec![Value::String(single)]);
        }
        serde_json::from_value(value).map_err(|e| bad_request(&e.to_string(), "invalid_image_request"))?
    };
    if image.n.is_none_or(|n| n == 0) {
        image.n = Some(1);
    }
    if image.size.is_empty() {
        image.size = DEFAULT_SIZE.to_string();
    }
    if image.model.is_empty() {
        image.model = DEFAULT_IMAGE_MODEL.to_string();
    }
    Ok(image)
}

/// 提示词、尺寸、数量与编辑原图校验
pub(super) fn validate(image: &mut ImageRequest, mode: RelayMode) -> Result<(), RelayError> {
    if image.prompt.is_empty() {
        return Err(bad_request("prompt is required", "prompt_missing"));
    }
    if image_size_ratio(&image.model, &image.size).is_none() {
        return Err(bad_request("size not supported for this image model", "size_not_supported"));
    }
    if image.prompt.len() > image_prompt_limit(&image.model) {
        return Err(bad_request("prompt is too long", "prompt_too_long"));
    }
    let (min, max) = image_n_range(&image.model);
    let n = image.n.unwrap_or(1);
    if n < min || n > max {
        return Err(bad_request("invalid value of n", "n_not_within_range"));
    }
    if mode == RelayMode::ImagesEdits {
        if image.image.is_empty() {
            return Err(bad_request("image is required", "image_missing"));
        }
    } else {
        image.image.clear();
    }
    Ok(())
}

/// 尺寸倍率；dall-e-3 高清再乘系数
pub(super) fn cost_ratio(image: &ImageRequest) -> f64 {
    let mut ratio = image_size_ratio(&image.model, &image.size).unwrap_or(1.0);
    if image.quality == "hd" && image.model == "dall-e-3" {
        ratio *= if image.size == DEFAULT_SIZE { 2.0 } else { 1.5 };
    }
    ratio
}

pub(super) async fn relay_image(
    ctx: &AppContext,
    request: &RelayRequest,
    channel: &Channel,
) -> Result<Response, AttemptFailure> {
    let mut meta = request.meta(channel);
    let mut image = parse_request(request).await?;
    meta.map_model(&image.model);
    image.model.clone_from(&meta.actual_model);
    validate(&mut image, meta.mode)?;
    let cost_ratio = cost_ratio(&image);

    let options = ctx.options.snapshot();
    let model_ratio = model_ratio(&options, &meta.origin_model);
    let group_ratio = options.group_ratio(&meta.group);
    let ratio = model_ratio * group_ratio;
    #[allow(clippy::cast_possible_truncation)]
    let quota = (ratio * cost_ratio * 1000.0) as i64 * image.n.unwrap_or(1);

    let user_quota = ctx
        .model_cache
        .user_quota(meta.user_id)
        .await
        .map_err(|e| RelayError::wrap(e, "get_user_quota_failed", StatusCode::INTERNAL_SERVER_ERROR))?;
    if user_quota < quota {
        return Err(RelayError::wrap("user quota is not enough", "insufficient_user_quota", StatusCode::FORBIDDEN).into());
    }

    let adaptor = ctx.adaptors.resolve(meta.channel_kind);
    adaptor.init(&mut meta);
    let converted = adaptor
        .convert_image_request(&mut meta, image)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;
    let body = encode_body(&converted)?;
    ldebug!(&meta.request_id, LogStage::UpstreamRequest, LogComponent::Relay, "image_request_converted", "图片请求已转换", model = %meta.actual_model, quota = quota);

    let output = round_trip(adaptor.as_ref(), &mut meta, body, &request.headers)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;

    let request_id = meta.request_id.clone();
    let settlement = Settlement {
        pre: None,
        model_name: meta.origin_model.clone(),
        content: format!("模型倍率 {model_ratio:.2}，分组倍率 {group_ratio:.2}"),
        quota: Box::new(move |usage| {
            // 上游报告的用量更大时以其为准
            if usage.total_tokens > quota {
                lwarn!(&request_id, LogStage::Billing, LogComponent::Billing, "image_usage_override", "上游用量超过按张计费", reported = usage.total_tokens, quota = quota);
                Charged {
                    quota: usage.total_tokens,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                }
            } else {
                Charged {
                    quota,
                    ..Charged::default()
                }
            }
        }),
    };
    Ok(finish(ctx, &meta, output, settlement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method, header};
    use bytes::Bytes;
    use rstest::rstest;

    fn json_request(body: &str) -> RelayRequest {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        RelayRequest {
            request_id: "rid".to_string(),
            auth: crate::auth::AuthContext::default(),
            method: Method::POST,
            path_and_query: "/v1/images/generations".to_string(),
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_defaults_and_single_image_string() {
        let parsed = parse_request(&json_request(r#"{"prompt":"a cat","image":"https://x/cat.png"}"#))
            .await
            .unwrap();
        assert_eq!(parsed.model, "dall-e-2");
        assert_eq!(parsed.size, "1024x1024");
        assert_eq!(parsed.n, Some(1));
        assert_eq!(parsed.image, vec!["https://x/cat.png"]);
    }

    #[tokio::test]
    async fn test_multipart_upload_becomes_data_url() {
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\ngemini-2.0-flash-exp-image-generation\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"prompt\"\r\n\r\nmake it blue\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"a.png\"\r\nContent-Type: image/png\r\n\r\nPNGDATA\r\n\
             --{boundary}--\r\n"
        );
        let mut request = json_request("");
        request.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}")).unwrap(),
        );
        request.body = Bytes::from(body);
        let parsed = parse_request(&request).await.unwrap();
        assert_eq!(parsed.model, "gemini-2.0-flash-exp-image-generation");
        assert_eq!(parsed.prompt, "make it blue");
        assert_eq!(parsed.image.len(), 1);
        assert!(parsed.image[0].starts_with("data:image/png;base64,"));
    }

    #[rstest]
    #[case("dall-e-2", "", "256x256", 1, "prompt_missing")]
    #[case("dall-e-2", "cat", "1792x1024", 1, "size_not_supported")]
    #[case("dall-e-3", "cat", "1024x1024", 2, "n_not_within_range")]
    fn test_validate_rejects(
        #[case] model: &str,
        #[case] prompt: &str,
        #[case] size: &str,
        #[case] n: i64,
        #[case] code: &str,
    ) {
        let mut image = ImageRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            size: size.to_string(),
            n: Some(n),
            ..ImageRequest::default()
        };
        let err = validate(&mut image, RelayMode::ImagesGenerations).unwrap_err();
        assert_eq!(err.code_str(), code);
        assert_eq!(err.status_code, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_edit_requires_image_and_generation_drops_it() {
        let mut image = ImageRequest {
            model: "gemini-2.0-flash-exp-image-generation".to_string(),
            prompt: "cat".to_string(),
            size: "1024x1024".to_string(),
            n: Some(1),
            ..ImageRequest::default()
        };
        let err = validate(&mut image.clone(), RelayMode::ImagesEdits).unwrap_err();
        assert_eq!(err.code_str(), "image_missing");

        image.image = vec!["https://x/a.png".to_string()];
        validate(&mut image, RelayMode::ImagesGenerations).unwrap();
        assert!(image.image.is_empty());
    }

    #[rstest]
    #[case("dall-e-3", "hd", "1024x1024", 2.0)]
    #[case("dall-e-3", "hd", "1024x1792", 3.0)]
    #[case("dall-e-2", "", "512x512", 1.125)]
    fn test_cost_ratio(#[case] model: &str, #[case] quality: &str, #[case] size: &str, #[case] expected: f64) {
        let image = ImageRequest {
            model: model.to_string(),
            quality: quality.to_string(),
            size: size.to_string(),
            ..ImageRequest::default()
        };
        assert!((cost_ratio(&image) - expected).abs() < f64::EPSILON);
    }
}

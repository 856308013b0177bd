//! # 视频生成

use axum::http::StatusCode;
use axum::response::Response;

use super::{AttemptFailure, Charged, RelayRequest, Settlement, encode_body, finish, round_trip};
use crate::app::AppContext;
use crate::channel::Channel;
use crate::error::{ProxyError, RelayError};
use crate::logging::{LogComponent, LogStage};
use crate::relay::body::{MultipartForm, is_multipart, parse_json};
use crate::relay::model::{Usage, VideoRequest};
use crate::relay::ratio::{completion_ratio, image_size_ratio, model_ratio};
use crate::ldebug;

const DEFAULT_SIZE: &str = "1024x1024";

fn invalid(message: &str) -> RelayError {
    RelayError::wrap(message, "invalid_video_request", StatusCode::BAD_REQUEST)
}

pub(super) async fn parse_request(request: &RelayRequest) -> Result<VideoRequest, RelayError> {
    let from_proxy = |e: ProxyError| invalid(&e.message());
    let mut video = if is_multipart(&request.headers) {
        let form = MultipartForm::parse(&request.headers, &request.body)
            .await
            .map_err(from_proxy)?;
        let image = match form.files("image").next() {
            Some(file) => file.to_data_url().map_err(from_proxy)?,
            None => String::new(),
        };
        VideoRequest {
            model: form.text("model").unwrap_or_default(),
            prompt: form.text("prompt").unwrap_or_default(),
            negative_prompt: form.text("negative_prompt").unwrap_or_default(),
            size: form.text("size").unwrap_or_default(),
            n: form.int("n"),
            duration: form.int("duration"),
            image,
        }
    } else {
        parse_json(&request.body).map_err(from_proxy)?
    };
    if video.size.is_empty() {
        video.size = DEFAULT_SIZE.to_string();
    }
    if video.model.is_empty() {
        return Err(invalid("model is required"));
    }
    if video.prompt.is_empty() {
        return Err(RelayError::wrap("prompt is required", "prompt_missing", StatusCode::BAD_REQUEST));
    }
    Ok(video)
}

/// 上游报告的用量超过按次计费时改用 token 公式
pub(super) fn video_charge(quota: i64, usage: &Usage, completion_ratio: f64, ratio: f64) -> Charged {
    if usage.total_tokens <= quota {
        return Charged {
            quota,
            ..Charged::default()
        };
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let by_tokens = ((usage.completion_tokens as f64).mul_add(completion_ratio, usage.prompt_tokens as f64) * ratio).ceil() as i64;
    Charged {
        quota: by_tokens.max(usage.total_tokens),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    }
}

pub(super) async fn relay_video(
    ctx: &AppContext,
    request: &RelayRequest,
    channel: &Channel,
) -> Result<Response, AttemptFailure> {
    let mut meta = request.meta(channel);
    let mut video = parse_request(request).await?;
    meta.map_model(&video.model);
    video.model.clone_from(&meta.actual_model);

    let options = ctx.options.snapshot();
    let size_ratio = image_size_ratio(&video.model, &video.size).unwrap_or(1.0);
    let model_ratio = model_ratio(&options, &meta.origin_model);
    let group_ratio = options.group_ratio(&meta.group);
    let completion_ratio = completion_ratio(&options, &meta.origin_model, meta.channel_kind);
    let ratio = model_ratio * group_ratio;
    #[allow(clippy::cast_possible_truncation)]
    let quota = (ratio * size_ratio * 1000.0) as i64;

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
        .convert_video_request(&mut meta, video)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;
    let body = encode_body(&converted)?;
    ldebug!(&meta.request_id, LogStage::UpstreamRequest, LogComponent::Relay, "video_request_converted", "视频请求已转换", model = %meta.actual_model, quota = quota);

    let output = round_trip(adaptor.as_ref(), &mut meta, body, &request.headers)
        .await
        .map_err(|e| AttemptFailure::with_hints(e, &meta))?;
    let settlement = Settlement {
        pre: None,
        model_name: meta.origin_model.clone(),
        content: format!("模型倍率 {model_ratio:.2}，分组倍率 {group_ratio:.2}"),
        quota: Box::new(move |usage| video_charge(quota, usage, completion_ratio, ratio)),
    };
    Ok(finish(ctx, &meta, output, settlement))
}

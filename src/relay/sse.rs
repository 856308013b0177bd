//! # SSE 读写
//!
//! 读取上游逐行的 `data:` 帧；向客户端写出 `data: <json>\n\n` 并以 `data: [DONE]` 结束

use std::convert::Infallible;
use std::io;
use std::pin::Pin;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use super::model::Usage;
use crate::lerror;
use crate::logging::{LogComponent, LogStage};

/// 单行上限，防止异常上游撑爆内存
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
const CHANNEL_CAPACITY: usize = 64;

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// 上游响应体的逐行读取器
pub type UpstreamLines = FramedRead<StreamReader<ByteStream, Bytes>, LinesCodec>;

#[must_use]
pub fn upstream_lines(response: reqwest::Response) -> UpstreamLines {
    let stream: ByteStream = Box::pin(response.bytes_stream().map_err(io::Error::other));
    FramedRead::new(
        StreamReader::new(stream),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    )
}

/// 取出 `data:` 行的负载；其他行返回 `None`
#[must_use]
pub fn data_payload(line: &str) -> Option<&str> {
    if line.len() < 6 {
        return None;
    }
    line.strip_prefix("data:").map(str::trim)
}

/// 流式任务结束后交给计费的汇总
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSummary {
    pub usage: Usage,
    pub first_frame_at: Option<Instant>,
    /// 客户端提前断开
    pub client_closed: bool,
}

/// 面向客户端的 SSE 写出端
#[derive(Debug)]
pub struct SseWriter {
    request_id: String,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    first_frame_at: Option<Instant>,
    closed: bool,
}

/// 创建 SSE 响应与其写出端
#[must_use]
pub fn sse_response(request_id: String) -> (SseWriter, Response) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (
        SseWriter {
            request_id,
            tx,
            first_frame_at: None,
            closed: false,
        },
        response,
    )
}

impl SseWriter {
    /// 写出原始负载；客户端断开后返回 `false`
    pub async fn send_raw(&mut self, payload: &str) -> bool {
        if self.closed {
            return false;
        }
        let frame = Bytes::from(format!("data: {payload}\n\n"));
        if self.tx.send(Ok(frame)).await.is_err() {
            self.closed = true;
            return false;
        }
        self.first_frame_at.get_or_insert_with(Instant::now);
        true
    }

    pub async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(payload) => self.send_raw(&payload).await,
            Err(e) => {
                lerror!(&self.request_id, LogStage::Response, LogComponent::Relay, "sse_encode_failed", "序列化流式帧失败", error = %e);
                !self.closed
            }
        }
    }

    /// 结束标记
    pub async fn done(&mut self) -> bool {
        self.send_raw("[DONE]").await
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn summary(&self, usage: Usage) -> StreamSummary {
        StreamSummary {
            usage,
            first_frame_at: self.first_frame_at,
            client_closed: self.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_body(body: Body) -> String {
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("event: ping"), None);
        assert_eq!(data_payload("data:"), None);
    }

    #[tokio::test]
    async fn test_writer_frames() {
        let (mut writer, response) = sse_response("rid".to_string());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert!(writer.send_json(&serde_json::json!({"x": 1})).await);
        assert!(writer.done().await);
        drop(writer);
        let body = collect_body(response.into_body()).await;
        assert_eq!(body, "data: {\"x\":1}\n\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn test_writer_notices_closed_client() {
        let (mut writer, response) = sse_response("rid".to_string());
        drop(response);
        assert!(!writer.send_raw("x").await);
        assert!(writer.is_closed());
        assert!(writer.summary(Usage::default()).client_closed);
    }
}

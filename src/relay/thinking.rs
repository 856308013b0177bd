//! # 推理内容内联
//!
//! `include_thinking=false` 时推理走 `reasoning_content`；否则按标签并入 `content`：
//! 流式模式在首个推理片段前加开始标签、首个正文片段前加结束标签；
//! 块模式缓存全部推理，在正文开始前一次性输出。正文之后的推理另起一段。

use super::model::{DEFAULT_THINK_END, DEFAULT_THINK_START, Thinking};

/// 适配器在转换请求时确定的内联参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingHints {
    pub include: bool,
    pub block_tag: bool,
    pub start: String,
    pub end: String,
}

impl Default for ThinkingHints {
    fn default() -> Self {
        Self {
            include: false,
            block_tag: false,
            start: DEFAULT_THINK_START.to_string(),
            end: DEFAULT_THINK_END.to_string(),
        }
    }
}

impl ThinkingHints {
    /// 由请求中已启用的 `thinking` 块推导
    #[must_use]
    pub fn from_request(thinking: Option<&Thinking>) -> Self {
        let mut hints = Self::default();
        let Some(thinking) = thinking.filter(|t| t.enabled() && t.include_thinking) else {
            return hints;
        };
        hints.include = true;
        if let Some(tag) = &thinking.thinking_tag {
            hints.block_tag = tag.block_tag;
            if !tag.start.is_empty() {
                hints.start.clone_from(&tag.start);
            }
            if !tag.end.is_empty() {
                hints.end.clone_from(&tag.end);
            }
        }
        hints
    }
}

/// 单个增量经内联后的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlinedDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

impl InlinedDelta {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.content.is_none() && self.reasoning.is_none()
    }
}

/// 流式推理内联状态机
#[derive(Debug, Clone)]
pub struct ReasoningInliner {
    hints: ThinkingHints,
    started: bool,
    ended: bool,
    buffer: String,
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.filter(|t| !t.is_empty())
}

impl ReasoningInliner {
    #[must_use]
    pub const fn new(hints: ThinkingHints) -> Self {
        Self {
            hints,
            started: false,
            ended: false,
            buffer: String::new(),
        }
    }

    #[must_use]
    pub const fn hints(&self) -> &ThinkingHints {
        &self.hints
    }

    /// 处理一个增量；同一增量中推理先于正文
    pub fn push(&mut self, reasoning: Option<&str>, content: Option<&str>) -> InlinedDelta {
        let reasoning = non_empty(reasoning);
        let content = non_empty(content);
        if !self.hints.include {
            return InlinedDelta {
                content: content.map(str::to_string),
                reasoning: reasoning.map(str::to_string),
            };
        }

        let mut out = String::new();
        if let Some(reasoning) = reasoning {
            // 正文之后再次出现推理时另起一段
            if self.ended {
                self.started = false;
                self.ended = false;
            }
            if self.hints.block_tag {
                self.started = true;
                self.buffer.push_str(reasoning);
            } else {
                if !self.started {
                    self.started = true;
                    out.push_str(&self.hints.start);
                }
                out.push_str(reasoning);
            }
        }
        if let Some(content) = content {
            out.push_str(&self.close());
            out.push_str(content);
        }
        InlinedDelta {
            content: Some(out).filter(|o| !o.is_empty()),
            reasoning: None,
        }
    }

    /// 结束推理段；未开始或已结束时为空串
    fn close(&mut self) -> String {
        if !self.started || self.ended {
            return String::new();
        }
        self.ended = true;
        if self.hints.block_tag {
            let body = std::mem::take(&mut self.buffer);
            format!("{}{body}{}", self.hints.start, self.hints.end)
        } else {
            self.hints.end.clone()
        }
    }

    /// 流结束时补齐未闭合的推理段
    pub fn finish(&mut self) -> Option<String> {
        if !self.hints.include {
            return None;
        }
        Some(self.close()).filter(|s| !s.is_empty())
    }

    /// 非流式响应：返回 (content, reasoning_content)
    #[must_use]
    pub fn inline_buffered(hints: &ThinkingHints, reasoning: &str, content: &str) -> (String, Option<String>) {
        if reasoning.is_empty() {
            return (content.to_string(), None);
        }
        if hints.include {
            (format!("{}{reasoning}{}{content}", hints.start, hints.end), None)
        } else {
            (content.to_string(), Some(reasoning.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::model::ThinkingTag;

    fn hints(include: bool, block_tag: bool) -> ThinkingHints {
        ThinkingHints {
            include,
            block_tag,
            ..ThinkingHints::default()
        }
    }

    fn concat(inliner: &mut ReasoningInliner, deltas: &[(Option<&str>, Option<&str>)]) -> String {
        let mut out: String = deltas
            .iter()
            .filter_map(|(r, c)| inliner.push(*r, *c).content)
            .collect();
        out.extend(inliner.finish());
        out
    }

    #[test]
    fn test_streaming_inline_keeps_order() {
        let mut inliner = ReasoningInliner::new(hints(true, false));
        let out = concat(
            &mut inliner,
            &[
                (Some("r1"), None),
                (Some("r2"), None),
                (Some("r3"), None),
                (None, Some("t1")),
                (None, Some("t2")),
            ],
        );
        assert_eq!(out, "<think>r1r2r3</think>t1t2");
    }

    #[test]
    fn test_block_mode_emits_once() {
        let mut inliner = ReasoningInliner::new(hints(true, true));
        assert!(inliner.push(Some("a"), None).is_empty());
        assert!(inliner.push(Some("b"), None).is_empty());
        let delta = inliner.push(None, Some("text"));
        assert_eq!(delta.content.as_deref(), Some("<think>ab</think>text"));
        assert_eq!(inliner.finish(), None);
    }

    #[test]
    fn test_unclosed_reasoning_closed_on_finish() {
        let mut inliner = ReasoningInliner::new(hints(true, false));
        assert_eq!(concat(&mut inliner, &[(Some("only"), None)]), "<think>only</think>");
        let mut block = ReasoningInliner::new(hints(true, true));
        assert_eq!(concat(&mut block, &[(Some("only"), None)]), "<think>only</think>");
    }

    #[test]
    fn test_reasoning_after_text_reopens_segment() {
        let deltas = [(Some("r1"), None), (None, Some("t1")), (Some("r2"), None), (None, Some("t2"))];
        let mut streaming = ReasoningInliner::new(hints(true, false));
        assert_eq!(concat(&mut streaming, &deltas), "<think>r1</think>t1<think>r2</think>t2");
        let mut block = ReasoningInliner::new(hints(true, true));
        assert_eq!(concat(&mut block, &deltas), "<think>r1</think>t1<think>r2</think>t2");

        // 末尾的推理由 finish 收尾
        let mut trailing = ReasoningInliner::new(hints(true, true));
        assert_eq!(
            concat(&mut trailing, &[(Some("r1"), None), (None, Some("t1")), (Some("r2"), None)]),
            "<think>r1</think>t1<think>r2</think>"
        );
    }

    #[test]
    fn test_separate_reasoning_field() {
        let mut inliner = ReasoningInliner::new(hints(false, false));
        let delta = inliner.push(Some("why"), Some("answer"));
        assert_eq!(delta.reasoning.as_deref(), Some("why"));
        assert_eq!(delta.content.as_deref(), Some("answer"));
        assert_eq!(inliner.finish(), None);
    }

    #[test]
    fn test_hints_from_request() {
        let thinking = Thinking {
            kind: "enabled".to_string(),
            include_thinking: true,
            thinking_tag: Some(ThinkingTag {
                block_tag: true,
                start: "<r>".to_string(),
                end: String::new(),
            }),
            ..Thinking::default()
        };
        let hints = ThinkingHints::from_request(Some(&thinking));
        assert!(hints.include && hints.block_tag);
        assert_eq!(hints.start, "<r>");
        assert_eq!(hints.end, "</think>");
        assert!(!ThinkingHints::from_request(None).include);
    }

    #[test]
    fn test_buffered_inline() {
        let (content, reasoning) = ReasoningInliner::inline_buffered(&hints(true, false), "r", "c");
        assert_eq!(content, "<think>r</think>c");
        assert!(reasoning.is_none());
        let (content, reasoning) = ReasoningInliner::inline_buffered(&hints(false, false), "r", "c");
        assert_eq!(content, "c");
        assert_eq!(reasoning.as_deref(), Some("r"));
    }
}

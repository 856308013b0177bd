//! # 流式工具调用累积

use super::model::{Function, Tool};

#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// 跨帧累积工具调用参数
#[derive(Debug, Clone, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PendingCall>,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 新的工具调用开始，返回其序号
    pub fn start(&mut self, id: &str, name: &str) -> usize {
        self.calls.push(PendingCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: String::new(),
        });
        self.calls.len() - 1
    }

    /// 追加到最近一个工具调用
    pub fn append_arguments(&mut self, partial: &str) -> Option<usize> {
        let index = self.calls.len().checked_sub(1)?;
        self.calls[index].arguments.push_str(partial);
        Some(index)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// 参数仍为空的调用，结束时以 `"{}"` 补发
    #[must_use]
    pub fn finish(&self) -> Vec<Tool> {
        self.calls
            .iter()
            .enumerate()
            .filter(|(_, call)| call.arguments.is_empty())
            .map(|(index, call)| Tool {
                index: Some(index),
                id: call.id.clone(),
                kind: "function".to_string(),
                function: Function {
                    name: call.name.clone(),
                    arguments: Some("{}".to_string()),
                    ..Function::default()
                },
            })
            .collect()
    }

    /// 完整的调用列表（非流式汇总用）
    #[must_use]
    pub fn into_tools(self) -> Vec<Tool> {
        self.calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| Tool {
                index: Some(index),
                id: call.id,
                kind: "function".to_string(),
                function: Function {
                    name: call.name,
                    arguments: Some(if call.arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        call.arguments
                    }),
                    ..Function::default()
                },
            })
            .collect()
    }
}

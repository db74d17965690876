//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按顺序回放预置回复；回放完后返回一段同时满足失败诊断与屏幕理解格式的中性 JSON。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// 中性回复：诊断为「原样重试」，理解为 idle 且无问题
pub const MOCK_FALLBACK_RESPONSE: &str = r#"{"root_cause": "unknown (mock)", "fixes": [{"strategy": "retry", "likelihood": 50, "implementation": "retry with the same arguments"}], "understanding": "mock observation", "state": "idle", "next_action": null, "confidence": 0.0, "issues_detected": [], "patterns_observed": []}"#;

#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 收到过的最后一条 user 消息内容（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::llm::Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(last_user);
        }

        let next = self
            .responses
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front();
        Ok(next.unwrap_or_else(|| MOCK_FALLBACK_RESPONSE.to_string()))
    }
}

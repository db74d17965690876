//! 诊断服务背后的文本补全接口

use async_trait::async_trait;

use crate::llm::Message;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 一次性补全；Err 为后端错误描述（诊断层映射为 DiagnosisUnavailable）
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 用于日志的后端/模型名
    fn name(&self) -> &str {
        "llm"
    }

    /// (prompt, completion, total) 累计 token
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

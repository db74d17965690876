//! 引擎错误类型
//!
//! 工具失败（ToolInvocation / ToolTimeout / UnknownTool）一律触发恢复；
//! 诊断不可用在恢复中是该步骤的终止条件；采样失败只记录日志，不向上传播。
//! 会话取消不是错误，体现在 TaskResult.cancelled 上。

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Tool '{tool}' failed: {message}")]
    ToolInvocation { tool: String, message: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 诊断服务不可达、超时或返回无法解析的内容
    #[error("Diagnosis unavailable: {0}")]
    DiagnosisUnavailable(String),

    #[error("Recovery exhausted for step {step}: {reason}")]
    RecoveryExhausted { step: usize, reason: String },

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Session already executed")]
    SessionReused,
}

impl EngineError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolInvocation {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// 是否属于「步骤动作失败」，即应交给恢复控制器处理的错误
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolInvocation { .. } | Self::ToolTimeout(_) | Self::UnknownTool(_)
        )
    }
}

//! 工具调用边界
//!
//! 引擎只通过 ToolInvoker 调用具体动作（click / type / navigate / OCR / screenshot），
//! 具体工具由外部实现并注册到 ToolRegistry，ToolExecutor 负责超时与审计日志。

pub mod executor;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Args, EngineError};

pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry};

/// 工具调用：同名同参可重复调用（Retry 才有意义）。
/// Err 表示动作本身失败；工具自身返回的「业务上不成功」结果应放在 Ok 的载荷里。
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &str, args: &Args) -> Result<Value, EngineError>;
}

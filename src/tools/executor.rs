//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时，invoke(tool, args) 在超时内调用 registry.execute，
//! 超时转为 ToolTimeout；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{Args, EngineError};
use crate::tools::{ToolInvoker, ToolRegistry};

const ARGS_PREVIEW_CHARS: usize = 200;

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    async fn invoke(&self, tool: &str, args: &Args) -> Result<Value, EngineError> {
        let start = Instant::now();
        let result = timeout(self.timeout, self.registry.execute(tool, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(EngineError::ToolTimeout(tool.to_string())),
        }
    }
}

fn args_preview(args: &Args) -> String {
    let s = Value::Object(args.clone()).to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

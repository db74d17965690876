//! 会话事件：步骤状态变化、自我调试过程、观察建议与问题
//!
//! 步骤事件经调用方提供的 mpsc 通道推送；观察事件经 broadcast 推送，可多处订阅。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::StepStatus;
use crate::diagnostics::FixStrategy;

/// 单个事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 每次步骤状态转移一条
    StepStatusChanged {
        index: usize,
        description: String,
        from: StepStatus,
        to: StepStatus,
    },
    /// 步骤失败，进入自我调试
    RecoveryStarted { index: usize, error: String },
    /// 诊断完成，选定的修复策略
    RecoveryDecision {
        index: usize,
        strategy: FixStrategy,
        likelihood: u8,
        root_cause: String,
    },
    RecoveryFinished { index: usize, resolved: bool },
    /// 观察循环给出的下一步建议
    Suggestion { action: String, at: DateTime<Utc> },
    /// 观察循环发现的问题
    IssuesDetected { issues: Vec<String>, at: DateTime<Utc> },
    /// 新增一条观察，total 为本会话累计条数
    ObservationRecorded { total: u64 },
    SessionFinished { success: bool, cancelled: bool },
}

pub(crate) fn send_event(tx: &Option<UnboundedSender<SessionEvent>>, ev: SessionEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

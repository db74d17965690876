//! Taskpilot - 计划执行引擎与自我调试循环
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 计划与步骤模型、步骤驱动器、恢复控制器、任务会话、事件
//! - **diagnostics**: 诊断服务契约（失败诊断 / 屏幕理解）与基于 LLM 的实现
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **observer**: 后台观察循环、观察历史与模式表、状态采样
//! - **tools**: 工具调用边界（ToolInvoker）、注册表与带超时的执行器
//! - **workflow**: 将成功执行的计划导出为可复用工作流

pub mod config;
pub mod core;
pub mod diagnostics;
pub mod llm;
pub mod observability;
pub mod observer;
pub mod tools;
pub mod workflow;

pub use crate::core::{
    Args, EngineError, EngineSettings, Plan, PlannedStep, RecoveryRecord, SessionEvent,
    SessionOptions, Step, StepStatus, TaskResult, TaskSession,
};
pub use config::{load_config, AppConfig};
pub use diagnostics::{Diagnosis, DiagnosticService, Fix, FixStrategy, LlmDiagnostics};
pub use observer::{
    ElementDetector, LearningSummary, Observation, ObservationStore, ObserverLoop, StateSampler,
};
pub use tools::{ToolExecutor, ToolInvoker, ToolRegistry};
pub use workflow::Workflow;

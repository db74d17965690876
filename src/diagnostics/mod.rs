//! 诊断服务契约
//!
//! 两种请求：步骤失败诊断（返回根因与按可能性排序的修复列表）、屏幕理解（返回分析、状态、建议、问题与模式）。
//! 实现必须「失败即报错」：无法解析的回复以 DiagnosisUnavailable 返回，不能当作「没有问题」。
//! 引擎只依赖 DiagnosticService trait，可替换为规则或其它分类器。

pub mod llm;
pub mod parse;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Args, EngineError, Plan};
use crate::observer::{DetectedElement, Observation, Snapshot};

pub use llm::LlmDiagnostics;

/// 修复策略（封闭枚举，穷尽匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStrategy {
    /// 原参数重试
    Retry,
    /// 合并替换参数后重试
    ModifyArgs,
    /// 换用另一个工具
    AlternativeApproach,
    /// 视为无操作成功，继续后续步骤
    Skip,
}

impl FixStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::ModifyArgs => "modify_args",
            Self::AlternativeApproach => "alternative_approach",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FixStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "retry" => Ok(Self::Retry),
            "modify_args" => Ok(Self::ModifyArgs),
            "alternative_approach" | "alternative" => Ok(Self::AlternativeApproach),
            "skip" => Ok(Self::Skip),
            other => Err(EngineError::DiagnosisUnavailable(format!(
                "unknown fix strategy: {other}"
            ))),
        }
    }
}

/// 单个修复建议
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub strategy: FixStrategy,
    /// 成功可能性 0..=100
    pub likelihood: u8,
    #[serde(default)]
    pub implementation: String,
    /// ModifyArgs / AlternativeApproach 使用的替换参数
    #[serde(default)]
    pub replacement_args: Option<Args>,
    /// AlternativeApproach 使用的替代工具
    #[serde(default)]
    pub alternative_tool: Option<String>,
}

impl Fix {
    pub fn new(strategy: FixStrategy, likelihood: u8) -> Self {
        Self {
            strategy,
            likelihood: likelihood.min(100),
            implementation: String::new(),
            replacement_args: None,
            alternative_tool: None,
        }
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.replacement_args = Some(args);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.alternative_tool = Some(tool.into());
        self
    }

    pub fn with_implementation(mut self, text: impl Into<String>) -> Self {
        self.implementation = text.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    pub fixes: Vec<Fix>,
}

impl Diagnosis {
    /// 可能性最高的修复；并列时取列表中靠前的
    pub fn top_fix(&self) -> Option<&Fix> {
        self.fixes.iter().fold(None, |best: Option<&Fix>, fix| match best {
            Some(b) if b.likelihood >= fix.likelihood => Some(b),
            _ => Some(fix),
        })
    }
}

/// 失败步骤的描述
#[derive(Debug, Clone, Serialize)]
pub struct FailedStep {
    pub index: usize,
    pub description: String,
    pub tool: String,
    pub args: Args,
    pub error: String,
}

/// 此前成功步骤的结果
#[derive(Debug, Clone, Serialize)]
pub struct PriorResult {
    pub index: usize,
    pub description: String,
    pub result: Option<Value>,
}

/// 失败诊断请求
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisRequest {
    pub failed_step: FailedStep,
    pub prior_results: Vec<PriorResult>,
    pub plan: Plan,
    /// 失败后截取的状态快照（采样失败时为空）
    pub snapshot: Option<Snapshot>,
    /// 观察循环最近一条观察（可能早于本次失败）
    pub latest_observation: Option<Observation>,
}

/// 屏幕理解请求里的历史观察摘要
#[derive(Debug, Clone, Serialize)]
pub struct ObservationDigest {
    pub timestamp: DateTime<Utc>,
    pub analysis: String,
}

/// 屏幕理解请求
#[derive(Debug, Clone, Serialize)]
pub struct UnderstandRequest {
    pub snapshot: Option<Snapshot>,
    pub recent: Vec<ObservationDigest>,
    pub elements: Vec<DetectedElement>,
}

/// 屏幕理解结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScreenUnderstanding {
    pub analysis: String,
    /// idle / working / error / loading / complete
    pub state: String,
    pub next_action: Option<String>,
    pub confidence: f32,
    pub issues: Vec<String>,
    pub patterns: Vec<String>,
}

#[async_trait]
pub trait DiagnosticService: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, EngineError>;

    async fn understand(
        &self,
        request: &UnderstandRequest,
    ) -> Result<ScreenUnderstanding, EngineError>;
}

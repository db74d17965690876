//! 计划、步骤与执行结果
//!
//! Plan 由外部 Planner 产生，执行期间只读；Step 是运行时记录，只由步骤驱动器与恢复控制器修改，
//! 状态只转移不删除。TaskResult 汇总每个步骤的终态（包括从未执行到的 Pending）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::EngineError;
use crate::diagnostics::FixStrategy;
use crate::observer::LearningSummary;

/// 工具参数：字符串键到任意 JSON 值
pub type Args = serde_json::Map<String, Value>;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Recovered,
}

impl StepStatus {
    /// Completed 与 Recovered 视为成功终态
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Recovered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Recovered => "recovered",
        }
    }
}

/// 计划中的一步（Planner 输出）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub args: Args,
}

impl PlannedStep {
    pub fn new(description: impl Into<String>, tool: impl Into<String>, args: Args) -> Self {
        Self {
            description: description.into(),
            tool: tool.into(),
            args,
        }
    }
}

/// 有序步骤序列；顺序即执行顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, alias = "task_summary")]
    pub summary: String,
    pub steps: Vec<PlannedStep>,
}

impl Plan {
    pub fn new(summary: impl Into<String>, steps: Vec<PlannedStep>) -> Self {
        Self {
            summary: summary.into(),
            steps,
        }
    }

    /// 解析 Planner 产出的 JSON 计划
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let plan: Plan =
            serde_json::from_str(raw).map_err(|e| EngineError::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// 每个步骤都必须指明工具名
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some((index, _)) = self
            .steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.tool.trim().is_empty())
        {
            return Err(EngineError::InvalidPlan(format!(
                "step {index} has no tool name"
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// 一次自我调试的记录（每次步骤失败至多一条）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub root_cause: Option<String>,
    pub strategy: Option<FixStrategy>,
    pub likelihood: Option<u8>,
    pub resolved: bool,
    /// 未解决时的原因（诊断不可用 / 重试仍失败 / 次数耗尽）
    pub reason: Option<String>,
}

/// 步骤运行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub description: String,
    pub tool: String,
    pub args: Args,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// 已发起的工具调用次数（含首次）
    pub attempts: u32,
    pub recovery: Option<RecoveryRecord>,
}

impl Step {
    pub fn from_planned(index: usize, planned: &PlannedStep) -> Self {
        Self {
            index,
            description: planned.description.clone(),
            tool: planned.tool.clone(),
            args: planned.args.clone(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            recovery: None,
        }
    }

    /// 转移状态，返回旧状态
    pub(crate) fn transition(&mut self, to: StepStatus) -> StepStatus {
        std::mem::replace(&mut self.status, to)
    }

    /// 是否以 Skip 策略恢复（没有真正完成原意图）
    pub fn was_skipped(&self) -> bool {
        self.status == StepStatus::Recovered
            && self
                .recovery
                .as_ref()
                .is_some_and(|r| r.strategy == Some(FixStrategy::Skip))
    }
}

/// 会话执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub session_id: String,
    /// 计划摘要（Planner 给出的任务描述）
    pub task_summary: String,
    pub steps: Vec<Step>,
    pub success: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    /// 面向用户的结果摘要
    pub summary: String,
    /// 观察循环的学习统计（仅在启用观察时存在，只含计数）
    pub learning: Option<LearningSummary>,
}

impl TaskResult {
    pub(crate) fn from_steps(
        session_id: String,
        task_summary: String,
        steps: Vec<Step>,
        cancelled: bool,
        elapsed_ms: u64,
    ) -> Self {
        let success = !cancelled && steps.iter().all(|s| s.status.is_success());
        let mut result = Self {
            session_id,
            task_summary,
            steps,
            success,
            cancelled,
            elapsed_ms,
            summary: String::new(),
            learning: None,
        };
        result.summary = result.render_summary();
        result
    }

    pub fn statuses(&self) -> Vec<StepStatus> {
        self.steps.iter().map(|s| s.status).collect()
    }

    pub fn succeeded_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_success()).count()
    }

    /// 发起过的自我调试次数
    pub fn recovery_attempts(&self) -> usize {
        self.steps.iter().filter(|s| s.recovery.is_some()).count()
    }

    pub fn render_summary(&self) -> String {
        let total = self.steps.len();
        let done = self.succeeded_count();
        let mut text = if self.success {
            format!("Task completed successfully: {done}/{total} steps")
        } else if self.cancelled {
            format!("Task cancelled: {done} of {total} steps completed")
        } else {
            format!("Task partially completed: {done} of {total} steps")
        };
        if !self.task_summary.is_empty() {
            text = format!("{text} ({})", self.task_summary);
        }
        let recovered = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Recovered)
            .count();
        if recovered > 0 {
            text.push_str(&format!(", {recovered} recovered"));
        }
        if let Some(failed) = self.steps.iter().find(|s| s.status == StepStatus::Failed) {
            text.push_str(&format!(
                ", halted at step {}: {}",
                failed.index,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Args {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_plan_from_json() {
        let plan = Plan::from_json(
            r#"{"task_summary": "login", "steps": [
                {"description": "click login", "tool": "click", "args": {"target": "login"}},
                {"description": "wait", "tool": "wait"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(plan.summary, "login");
        assert_eq!(plan.len(), 2);
        assert!(plan.steps[1].args.is_empty());
    }

    #[test]
    fn test_plan_rejects_empty_tool() {
        let err = Plan::from_json(r#"{"steps": [{"description": "x", "tool": " "}]}"#)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));
    }

    #[test]
    fn test_result_success_requires_all_steps() {
        let plan = Plan::new(
            "t",
            vec![
                PlannedStep::new("a", "click", args(json!({}))),
                PlannedStep::new("b", "click", args(json!({}))),
            ],
        );
        let mut steps: Vec<Step> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| Step::from_planned(i, s))
            .collect();
        steps[0].status = StepStatus::Recovered;
        let partial = TaskResult::from_steps("s".into(), "t".into(), steps.clone(), false, 0);
        assert!(!partial.success);
        assert!(partial.summary.contains("1 of 2"));

        steps[1].status = StepStatus::Completed;
        let full = TaskResult::from_steps("s".into(), "t".into(), steps, false, 0);
        assert!(full.success);
        assert!(full.summary.contains("1 recovered"));
    }

    #[test]
    fn test_cancelled_result_is_not_success() {
        let result = TaskResult::from_steps("s".into(), String::new(), vec![], true, 0);
        assert!(!result.success);
        assert!(result.summary.starts_with("Task cancelled"));
    }

    #[test]
    fn test_empty_plan_succeeds() {
        let result = TaskResult::from_steps("s".into(), String::new(), vec![], false, 0);
        assert!(result.success);
    }
}

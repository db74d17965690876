//! 恢复控制器：一次步骤失败对应一次自我调试
//!
//! 采样快照（尽力而为）→ 诊断 → 取可能性最高的修复 → 按策略分派。
//! 诊断失败、重调用失败、次数耗尽都终止该步骤；从不重试诊断本身，也不对恢复再做恢复。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::core::events::send_event;
use crate::core::{Args, EngineError, Plan, RecoveryRecord, SessionEvent, Step};
use crate::diagnostics::{
    DiagnosisRequest, DiagnosticService, FailedStep, Fix, FixStrategy, PriorResult,
};
use crate::observer::{ObservationStore, Snapshot, StateSampler};
use crate::tools::ToolInvoker;

pub struct RecoveryController {
    invoker: Arc<dyn ToolInvoker>,
    diagnostics: Arc<dyn DiagnosticService>,
    sampler: Option<Arc<dyn StateSampler>>,
    store: Option<ObservationStore>,
    /// 每步调用次数上限（含首次调用）
    max_attempts: u32,
    diagnosis_timeout: Duration,
    events: Option<UnboundedSender<SessionEvent>>,
}

impl RecoveryController {
    pub fn new(invoker: Arc<dyn ToolInvoker>, diagnostics: Arc<dyn DiagnosticService>) -> Self {
        Self {
            invoker,
            diagnostics,
            sampler: None,
            store: None,
            max_attempts: 2,
            diagnosis_timeout: Duration::from_secs(60),
            events: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Option<Arc<dyn StateSampler>>) -> Self {
        self.sampler = sampler;
        self
    }

    /// 诊断时读取其 latest()；观察循环未启用时不设置
    pub fn with_store(mut self, store: Option<ObservationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_diagnosis_timeout(mut self, timeout: Duration) -> Self {
        self.diagnosis_timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: Option<UnboundedSender<SessionEvent>>) -> Self {
        self.events = events;
        self
    }

    /// 尝试修复失败步骤；返回 true 表示已解决，可以继续后续步骤
    ///
    /// 无论结果如何都会在 step.recovery 上留下一条记录。
    pub async fn recover(&self, step: &mut Step, plan: &Plan, prior: &[PriorResult]) -> bool {
        let error = step.error.clone().unwrap_or_default();
        tracing::info!(step = step.index, tool = %step.tool, error = %error, "self-debug started");
        send_event(
            &self.events,
            SessionEvent::RecoveryStarted {
                index: step.index,
                error: error.clone(),
            },
        );

        let mut record = RecoveryRecord::default();
        let resolved = match self.self_debug(step, plan, prior, &error, &mut record).await {
            Ok(()) => true,
            Err(e) => {
                // 诊断失败对驱动器而言同样是 RecoveryExhausted
                let e = if matches!(e, EngineError::RecoveryExhausted { .. }) {
                    e
                } else {
                    EngineError::RecoveryExhausted {
                        step: step.index,
                        reason: e.to_string(),
                    }
                };
                tracing::warn!(step = step.index, error = %e, "self-debug failed");
                record.reason = Some(e.to_string());
                false
            }
        };
        record.resolved = resolved;
        step.recovery = Some(record);

        send_event(
            &self.events,
            SessionEvent::RecoveryFinished {
                index: step.index,
                resolved,
            },
        );
        resolved
    }

    async fn capture(&self) -> Option<Snapshot> {
        let sampler = self.sampler.as_ref()?;
        match sampler.capture().await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "snapshot before diagnosis failed, continuing without");
                None
            }
        }
    }

    async fn self_debug(
        &self,
        step: &mut Step,
        plan: &Plan,
        prior: &[PriorResult],
        error: &str,
        record: &mut RecoveryRecord,
    ) -> Result<(), EngineError> {
        let request = DiagnosisRequest {
            failed_step: FailedStep {
                index: step.index,
                description: step.description.clone(),
                tool: step.tool.clone(),
                args: step.args.clone(),
                error: error.to_string(),
            },
            prior_results: prior.to_vec(),
            plan: plan.clone(),
            snapshot: self.capture().await,
            latest_observation: self
                .store
                .as_ref()
                .and_then(|s| s.latest())
                .map(|o| (*o).clone()),
        };

        let diagnosis =
            match tokio::time::timeout(self.diagnosis_timeout, self.diagnostics.diagnose(&request))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EngineError::DiagnosisUnavailable(format!(
                        "diagnosis timed out after {}s",
                        self.diagnosis_timeout.as_secs_f64()
                    )))
                }
            };
        record.root_cause = Some(diagnosis.root_cause.clone());

        let fix = diagnosis
            .top_fix()
            .cloned()
            .ok_or_else(|| EngineError::DiagnosisUnavailable("diagnosis has no fixes".into()))?;
        record.strategy = Some(fix.strategy);
        record.likelihood = Some(fix.likelihood);

        tracing::info!(
            step = step.index,
            strategy = %fix.strategy,
            likelihood = fix.likelihood,
            root_cause = %diagnosis.root_cause,
            "recovery strategy selected"
        );
        send_event(
            &self.events,
            SessionEvent::RecoveryDecision {
                index: step.index,
                strategy: fix.strategy,
                likelihood: fix.likelihood,
                root_cause: diagnosis.root_cause.clone(),
            },
        );

        self.apply(step, fix).await
    }

    async fn apply(&self, step: &mut Step, fix: Fix) -> Result<(), EngineError> {
        if fix.strategy == FixStrategy::Skip {
            step.result = Some(json!({
                "skipped": true,
                "reason": fix.implementation,
            }));
            return Ok(());
        }

        if step.attempts >= self.max_attempts {
            return Err(EngineError::RecoveryExhausted {
                step: step.index,
                reason: format!("attempt limit {} reached", self.max_attempts),
            });
        }

        match fix.strategy {
            FixStrategy::Retry | FixStrategy::Skip => {}
            FixStrategy::ModifyArgs => {
                let replacement = fix.replacement_args.ok_or_else(|| {
                    EngineError::RecoveryExhausted {
                        step: step.index,
                        reason: "modify_args fix carries no replacement arguments".into(),
                    }
                })?;
                merge_args(&mut step.args, replacement);
            }
            FixStrategy::AlternativeApproach => {
                let tool = fix.alternative_tool.ok_or_else(|| EngineError::RecoveryExhausted {
                    step: step.index,
                    reason: "alternative_approach fix names no tool".into(),
                })?;
                tracing::info!(step = step.index, from = %step.tool, to = %tool, "switching tool");
                step.tool = tool;
                if let Some(replacement) = fix.replacement_args {
                    merge_args(&mut step.args, replacement);
                }
            }
        }

        self.reinvoke(step).await
    }

    /// 恢复内的重调用：出错即为终态，不再诊断
    async fn reinvoke(&self, step: &mut Step) -> Result<(), EngineError> {
        step.attempts += 1;
        match self.invoker.invoke(&step.tool, &step.args).await {
            Ok(value) => {
                step.result = Some(value);
                Ok(())
            }
            Err(e) => {
                step.error = Some(e.to_string());
                Err(EngineError::RecoveryExhausted {
                    step: step.index,
                    reason: format!("re-invocation failed: {e}"),
                })
            }
        }
    }
}

/// 替换参数覆盖同名键，其余键保留
fn merge_args(args: &mut Args, replacement: Args) {
    for (k, v) in replacement {
        args.insert(k, v);
    }
}

/// 此前成功步骤的描述与结果
pub(crate) fn prior_results(steps: &[Step]) -> Vec<PriorResult> {
    steps
        .iter()
        .filter(|s| s.status.is_success())
        .map(|s| PriorResult {
            index: s.index,
            description: s.description.clone(),
            result: s.result.clone().or(Some(Value::Null)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlannedStep, StepStatus};
    use crate::diagnostics::{Diagnosis, ScreenUnderstanding, UnderstandRequest};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用；tool 名为 "broken" 时失败
    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Args)>>,
    }

    #[async_trait]
    impl ToolInvoker for RecordingInvoker {
        async fn invoke(&self, tool: &str, args: &Args) -> Result<Value, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push((tool.to_string(), args.clone()));
            if tool == "broken" {
                Err(EngineError::tool(tool, "still broken"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct FixedDiagnosis(Result<Diagnosis, EngineError>);

    #[async_trait]
    impl DiagnosticService for FixedDiagnosis {
        async fn diagnose(&self, _: &DiagnosisRequest) -> Result<Diagnosis, EngineError> {
            self.0.clone()
        }

        async fn understand(&self, _: &UnderstandRequest) -> Result<ScreenUnderstanding, EngineError> {
            Ok(ScreenUnderstanding::default())
        }
    }

    fn failed_step(tool: &str, args: Value) -> (Step, Plan) {
        let planned = PlannedStep::new("click login", tool, args.as_object().cloned().unwrap());
        let plan = Plan::new("login", vec![planned.clone()]);
        let mut step = Step::from_planned(0, &planned);
        step.status = StepStatus::Failed;
        step.attempts = 1;
        step.error = Some("element not found".into());
        (step, plan)
    }

    fn controller(
        invoker: Arc<RecordingInvoker>,
        diagnosis: Result<Diagnosis, EngineError>,
    ) -> RecoveryController {
        RecoveryController::new(invoker, Arc::new(FixedDiagnosis(diagnosis)))
    }

    fn single(fix: Fix) -> Result<Diagnosis, EngineError> {
        Ok(Diagnosis {
            root_cause: "button moved".into(),
            fixes: vec![fix],
        })
    }

    #[tokio::test]
    async fn test_modify_args_merges_and_reinvokes() {
        let invoker = Arc::new(RecordingInvoker::default());
        let fix = Fix::new(FixStrategy::ModifyArgs, 90)
            .with_args(json!({"x": 120, "y": 340}).as_object().cloned().unwrap());
        let rc = controller(invoker.clone(), single(fix));
        let (mut step, plan) = failed_step("click", json!({"target": "login", "x": 1}));

        assert!(rc.recover(&mut step, &plan, &[]).await);
        assert_eq!(step.attempts, 2);
        assert_eq!(step.args["x"], 120);
        assert_eq!(step.args["y"], 340);
        assert_eq!(step.args["target"], "login");
        let record = step.recovery.as_ref().unwrap();
        assert!(record.resolved);
        assert_eq!(record.strategy, Some(FixStrategy::ModifyArgs));
        assert_eq!(invoker.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_alternative_tool_failure_is_final() {
        let invoker = Arc::new(RecordingInvoker::default());
        let rc = controller(
            invoker.clone(),
            single(Fix::new(FixStrategy::AlternativeApproach, 80).with_tool("broken")),
        );
        let (mut step, plan) = failed_step("click", json!({}));

        assert!(!rc.recover(&mut step, &plan, &[]).await);
        assert_eq!(step.tool, "broken");
        assert_eq!(step.error.as_deref(), Some("Tool 'broken' failed: still broken"));
        assert_eq!(invoker.calls.lock().unwrap().len(), 1);
        assert!(!step.recovery.unwrap().resolved);
    }

    #[tokio::test]
    async fn test_skip_marks_noop_success() {
        let invoker = Arc::new(RecordingInvoker::default());
        let rc = controller(invoker.clone(), single(Fix::new(FixStrategy::Skip, 50)));
        let (mut step, plan) = failed_step("click", json!({}));

        assert!(rc.recover(&mut step, &plan, &[]).await);
        assert_eq!(step.result.as_ref().unwrap()["skipped"], true);
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_limit_blocks_retry() {
        let invoker = Arc::new(RecordingInvoker::default());
        let rc = controller(invoker.clone(), single(Fix::new(FixStrategy::Retry, 99)))
            .with_max_attempts(1);
        let (mut step, plan) = failed_step("click", json!({}));

        assert!(!rc.recover(&mut step, &plan, &[]).await);
        assert!(invoker.calls.lock().unwrap().is_empty());
        let reason = step.recovery.unwrap().reason.unwrap();
        assert!(reason.contains("attempt limit"), "{reason}");
    }

    #[tokio::test]
    async fn test_diagnosis_failure_is_terminal() {
        let invoker = Arc::new(RecordingInvoker::default());
        let rc = controller(
            invoker.clone(),
            Err(EngineError::DiagnosisUnavailable("unreachable".into())),
        );
        let (mut step, plan) = failed_step("click", json!({}));

        assert!(!rc.recover(&mut step, &plan, &[]).await);
        assert_eq!(step.error.as_deref(), Some("element not found"));
        assert!(invoker.calls.lock().unwrap().is_empty());
        let record = step.recovery.unwrap();
        assert!(record.strategy.is_none());
        assert!(record.reason.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_modify_args_without_args_fails() {
        let invoker = Arc::new(RecordingInvoker::default());
        let rc = controller(invoker, single(Fix::new(FixStrategy::ModifyArgs, 90)));
        let (mut step, plan) = failed_step("click", json!({}));
        assert!(!rc.recover(&mut step, &plan, &[]).await);
    }

    struct BrokenCamera;

    #[async_trait]
    impl StateSampler for BrokenCamera {
        async fn capture(&self) -> Result<Snapshot, EngineError> {
            Err(EngineError::tool("screenshot", "display unavailable"))
        }
    }

    /// 记录诊断请求是否带快照，并返回一次重试
    #[derive(Default)]
    struct SnapshotAwareRetry {
        snapshots: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl DiagnosticService for SnapshotAwareRetry {
        async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, EngineError> {
            self.snapshots.lock().unwrap().push(request.snapshot.is_some());
            Ok(Diagnosis {
                root_cause: "transient".into(),
                fixes: vec![Fix::new(FixStrategy::Retry, 80)],
            })
        }

        async fn understand(&self, _: &UnderstandRequest) -> Result<ScreenUnderstanding, EngineError> {
            Ok(ScreenUnderstanding::default())
        }
    }

    #[tokio::test]
    async fn test_failed_snapshot_does_not_abort_recovery() {
        let invoker = Arc::new(RecordingInvoker::default());
        let diagnostics = Arc::new(SnapshotAwareRetry::default());
        let rc = RecoveryController::new(invoker.clone(), diagnostics.clone())
            .with_sampler(Some(Arc::new(BrokenCamera)));
        let (mut step, plan) = failed_step("click", json!({}));

        assert!(rc.recover(&mut step, &plan, &[]).await);
        assert_eq!(*diagnostics.snapshots.lock().unwrap(), vec![false]);
        assert_eq!(invoker.calls.lock().unwrap().len(), 1);
        assert_eq!(step.attempts, 2);
    }

    #[test]
    fn test_prior_results_only_successful() {
        let planned = PlannedStep::new("a", "click", Args::new());
        let mut ok = Step::from_planned(0, &planned);
        ok.status = StepStatus::Completed;
        ok.result = Some(json!("done"));
        let pending = Step::from_planned(1, &planned);
        let prior = prior_results(&[ok, pending]);
        assert_eq!(prior.len(), 1);
        assert_eq!(prior[0].result, Some(json!("done")));
    }
}

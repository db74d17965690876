//! 步骤驱动器：按序执行计划，失败时交给恢复控制器
//!
//! 每次状态转移都发出一个 StepStatusChanged 事件。恢复失败时立即停止，其余步骤保持 Pending。
//! 取消在每个步骤开始前检查，步骤失败后进入恢复前再检查一次；进行中的工具调用不强制中断。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::events::send_event;
use crate::core::recovery::{prior_results, RecoveryController};
use crate::core::{Plan, SessionEvent, Step, StepStatus};
use crate::tools::ToolInvoker;

/// 一次 run 的产出：全部步骤记录（含未执行的 Pending）与是否因取消而提前结束
#[derive(Debug)]
pub struct DriverOutcome {
    pub steps: Vec<Step>,
    pub cancelled: bool,
}

pub struct StepDriver {
    invoker: Arc<dyn ToolInvoker>,
    recovery: RecoveryController,
    events: Option<UnboundedSender<SessionEvent>>,
    cancel: CancellationToken,
}

impl StepDriver {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        recovery: RecoveryController,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invoker,
            recovery,
            events: None,
            cancel,
        }
    }

    pub fn with_events(mut self, events: Option<UnboundedSender<SessionEvent>>) -> Self {
        self.events = events;
        self
    }

    fn transition(&self, step: &mut Step, to: StepStatus) {
        let from = step.transition(to);
        tracing::info!(step = step.index, from = from.as_str(), to = to.as_str(), "step transition");
        send_event(
            &self.events,
            SessionEvent::StepStatusChanged {
                index: step.index,
                description: step.description.clone(),
                from,
                to,
            },
        );
    }

    pub async fn run(&self, plan: &Plan) -> DriverOutcome {
        let mut steps: Vec<Step> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| Step::from_planned(i, s))
            .collect();

        let mut cancelled = false;
        for i in 0..steps.len() {
            if self.cancel.is_cancelled() {
                tracing::info!(step = i, "session cancelled, remaining steps not executed");
                cancelled = true;
                break;
            }

            let step = &mut steps[i];
            self.transition(step, StepStatus::Running);
            step.attempts += 1;

            match self.invoker.invoke(&step.tool, &step.args).await {
                Ok(value) => {
                    step.result = Some(value);
                    self.transition(step, StepStatus::Completed);
                }
                Err(e) => {
                    tracing::warn!(step = i, tool = %step.tool, error = %e, "step failed");
                    step.error = Some(e.to_string());
                    self.transition(step, StepStatus::Failed);

                    if self.cancel.is_cancelled() {
                        tracing::info!(step = i, "session cancelled during step, recovery not started");
                        cancelled = true;
                        break;
                    }

                    let prior = prior_results(&steps[..i]);
                    let step = &mut steps[i];
                    if self.recovery.recover(step, plan, &prior).await {
                        self.transition(step, StepStatus::Recovered);
                    } else {
                        tracing::warn!(step = i, "recovery failed, halting plan");
                        break;
                    }
                }
            }
        }

        DriverOutcome { steps, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Args, EngineError, PlannedStep};
    use crate::diagnostics::{
        Diagnosis, DiagnosisRequest, DiagnosticService, Fix, FixStrategy, ScreenUnderstanding,
        UnderstandRequest,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    /// 指定工具名失败，其余成功
    struct FailOn(&'static str);

    #[async_trait]
    impl ToolInvoker for FailOn {
        async fn invoke(&self, tool: &str, _args: &Args) -> Result<Value, EngineError> {
            if tool == self.0 {
                Err(EngineError::tool(tool, "element not found"))
            } else {
                Ok(json!({"tool": tool}))
            }
        }
    }

    struct Unreachable;

    #[async_trait]
    impl DiagnosticService for Unreachable {
        async fn diagnose(&self, _: &DiagnosisRequest) -> Result<Diagnosis, EngineError> {
            Err(EngineError::DiagnosisUnavailable("connection refused".into()))
        }

        async fn understand(&self, _: &UnderstandRequest) -> Result<ScreenUnderstanding, EngineError> {
            Err(EngineError::DiagnosisUnavailable("connection refused".into()))
        }
    }

    struct AlwaysSkip;

    #[async_trait]
    impl DiagnosticService for AlwaysSkip {
        async fn diagnose(&self, _: &DiagnosisRequest) -> Result<Diagnosis, EngineError> {
            Ok(Diagnosis {
                root_cause: "optional step".into(),
                fixes: vec![Fix::new(FixStrategy::Skip, 70)],
            })
        }

        async fn understand(&self, _: &UnderstandRequest) -> Result<ScreenUnderstanding, EngineError> {
            Ok(ScreenUnderstanding::default())
        }
    }

    fn plan(tools: &[&str]) -> Plan {
        Plan::new(
            "t",
            tools
                .iter()
                .map(|t| PlannedStep::new(format!("run {t}"), *t, Args::new()))
                .collect(),
        )
    }

    fn driver(
        invoker: Arc<dyn ToolInvoker>,
        diagnostics: Arc<dyn DiagnosticService>,
        cancel: CancellationToken,
    ) -> StepDriver {
        let recovery = RecoveryController::new(invoker.clone(), diagnostics);
        StepDriver::new(invoker, recovery, cancel)
    }

    #[tokio::test]
    async fn test_all_steps_complete_with_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let d = driver(
            Arc::new(FailOn("none")),
            Arc::new(Unreachable),
            CancellationToken::new(),
        )
        .with_events(Some(tx));
        let out = d.run(&plan(&["a", "b"])).await;

        assert!(!out.cancelled);
        assert!(out.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(out.steps[1].result, Some(json!({"tool": "b"})));

        drop(d);
        let mut transitions = Vec::new();
        while let Some(SessionEvent::StepStatusChanged { index, to, .. }) = rx.recv().await {
            transitions.push((index, to));
        }
        assert_eq!(
            transitions,
            vec![
                (0, StepStatus::Running),
                (0, StepStatus::Completed),
                (1, StepStatus::Running),
                (1, StepStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_recovery_halts_and_leaves_pending() {
        let d = driver(
            Arc::new(FailOn("b")),
            Arc::new(Unreachable),
            CancellationToken::new(),
        );
        let out = d.run(&plan(&["a", "b", "c", "d"])).await;
        let statuses: Vec<StepStatus> = out.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Completed,
                StepStatus::Failed,
                StepStatus::Pending,
                StepStatus::Pending
            ]
        );
        assert_eq!(out.steps[2].attempts, 0);
    }

    #[tokio::test]
    async fn test_recovered_step_continues() {
        let d = driver(
            Arc::new(FailOn("b")),
            Arc::new(AlwaysSkip),
            CancellationToken::new(),
        );
        let out = d.run(&plan(&["a", "b", "c"])).await;
        assert_eq!(out.steps[1].status, StepStatus::Recovered);
        assert!(out.steps[1].was_skipped());
        assert_eq!(out.steps[2].status, StepStatus::Completed);
    }

    /// 调用期间取消会话，随后调用失败
    struct CancelThenFail(CancellationToken);

    #[async_trait]
    impl ToolInvoker for CancelThenFail {
        async fn invoke(&self, tool: &str, _args: &Args) -> Result<Value, EngineError> {
            self.0.cancel();
            Err(EngineError::tool(tool, "window closed"))
        }
    }

    struct CountingRetry(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl DiagnosticService for CountingRetry {
        async fn diagnose(&self, _: &DiagnosisRequest) -> Result<Diagnosis, EngineError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Diagnosis {
                root_cause: "flaky".into(),
                fixes: vec![Fix::new(FixStrategy::Retry, 90)],
            })
        }

        async fn understand(&self, _: &UnderstandRequest) -> Result<ScreenUnderstanding, EngineError> {
            Ok(ScreenUnderstanding::default())
        }
    }

    #[tokio::test]
    async fn test_cancel_during_failing_step_skips_recovery() {
        let token = CancellationToken::new();
        let diagnostics = Arc::new(CountingRetry(std::sync::atomic::AtomicUsize::new(0)));
        let d = driver(
            Arc::new(CancelThenFail(token.clone())),
            diagnostics.clone(),
            token,
        );
        let out = d.run(&plan(&["a", "b"])).await;

        assert!(out.cancelled);
        assert_eq!(diagnostics.0.load(std::sync::atomic::Ordering::SeqCst), 0);
        let statuses: Vec<StepStatus> = out.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![StepStatus::Failed, StepStatus::Pending]);
        assert_eq!(out.steps[0].attempts, 1);
        assert!(out.steps[0].recovery.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let d = driver(Arc::new(FailOn("none")), Arc::new(Unreachable), token);
        let out = d.run(&plan(&["a", "b"])).await;
        assert!(out.cancelled);
        assert!(out.steps.iter().all(|s| s.status == StepStatus::Pending));
    }
}

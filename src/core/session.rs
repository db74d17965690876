//! 任务会话：组合步骤驱动器与观察循环，执行一个计划
//!
//! 观察循环（若启用）在驱动器之前启动，在任何退出路径上都会停止；ObserverLoop 被丢弃时会取消自身。
//! 一个会话只能执行一次；取消令牌同时作用于驱动器与观察循环。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::driver::StepDriver;
use crate::core::events::send_event;
use crate::core::recovery::RecoveryController;
use crate::core::{EngineError, Plan, SessionEvent, TaskResult};
use crate::diagnostics::DiagnosticService;
use crate::observer::{
    ElementDetector, ObservationStore, ObserverLoop, ObserverSettings, StateSampler,
};
use crate::tools::ToolInvoker;

/// 每次执行的选项
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub enable_observer: bool,
    pub observation_interval_secs: f64,
    /// 每步调用次数上限（含首次调用）
    pub max_attempts_per_step: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            enable_observer: false,
            observation_interval_secs: 2.0,
            max_attempts_per_step: 2,
        }
    }
}

impl SessionOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            enable_observer: cfg.observer.enabled,
            observation_interval_secs: cfg.observer.interval_secs,
            max_attempts_per_step: cfg.engine.max_attempts_per_step,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts_per_step == 0 {
            return Err(EngineError::Config(
                "max_attempts_per_step must be at least 1".into(),
            ));
        }
        if !self.observation_interval_secs.is_finite() || self.observation_interval_secs <= 0.0 {
            return Err(EngineError::Config(format!(
                "observation interval must be positive, got {}",
                self.observation_interval_secs
            )));
        }
        Ok(())
    }
}

/// 会话级引擎参数（来自配置，不随每次执行变化）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub diagnosis_timeout: Duration,
    pub history_limit: usize,
    pub context_observations: usize,
    pub context_elements: usize,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            diagnosis_timeout: Duration::from_secs(cfg.engine.diagnosis_timeout_secs),
            history_limit: cfg.observer.history_limit,
            context_observations: cfg.observer.context_observations,
            context_elements: cfg.observer.context_elements,
            event_buffer: cfg.observer.event_buffer,
        }
    }
}

pub struct TaskSession {
    id: String,
    invoker: Arc<dyn ToolInvoker>,
    diagnostics: Arc<dyn DiagnosticService>,
    sampler: Option<Arc<dyn StateSampler>>,
    detector: Option<Arc<dyn ElementDetector>>,
    settings: EngineSettings,
    status_tx: Option<UnboundedSender<SessionEvent>>,
    observer_tx: broadcast::Sender<SessionEvent>,
    store: ObservationStore,
    cancel: CancellationToken,
    executed: AtomicBool,
}

impl TaskSession {
    pub fn new(invoker: Arc<dyn ToolInvoker>, diagnostics: Arc<dyn DiagnosticService>) -> Self {
        let settings = EngineSettings::default();
        let (observer_tx, _) = broadcast::channel(settings.event_buffer.max(1));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            invoker,
            diagnostics,
            sampler: None,
            detector: None,
            store: ObservationStore::new(settings.history_limit),
            settings,
            status_tx: None,
            observer_tx,
            cancel: CancellationToken::new(),
            executed: AtomicBool::new(false),
        }
    }

    /// 替换引擎参数；会重建观察存储与广播通道，需在 subscribe_observer 之前调用
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        let (observer_tx, _) = broadcast::channel(settings.event_buffer.max(1));
        self.observer_tx = observer_tx;
        self.store = ObservationStore::new(settings.history_limit);
        self.settings = settings;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn StateSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn ElementDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// 步骤状态事件通道（每次转移一条）
    pub fn with_status_events(mut self, tx: UnboundedSender<SessionEvent>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 订阅观察事件（建议 / 问题 / 新观察）
    pub fn subscribe_observer(&self) -> broadcast::Receiver<SessionEvent> {
        self.observer_tx.subscribe()
    }

    /// 本会话的观察存储（只读使用）
    pub fn observations(&self) -> &ObservationStore {
        &self.store
    }

    fn observer(&self, options: &SessionOptions) -> Result<Option<ObserverLoop>, EngineError> {
        if !options.enable_observer {
            return Ok(None);
        }
        let sampler = self.sampler.clone().ok_or_else(|| {
            EngineError::Config("observer enabled but no state sampler configured".into())
        })?;
        Ok(Some(ObserverLoop::new(
            sampler,
            self.detector.clone(),
            Arc::clone(&self.diagnostics),
            self.store.clone(),
            ObserverSettings {
                interval: Duration::from_secs_f64(options.observation_interval_secs),
                context_observations: self.settings.context_observations,
                context_elements: self.settings.context_elements,
                understand_timeout: self.settings.diagnosis_timeout,
            },
            self.observer_tx.clone(),
        )))
    }

    /// 执行计划；取消不是错误，返回 cancelled = true 的部分结果
    pub async fn execute(
        &self,
        plan: &Plan,
        options: SessionOptions,
    ) -> Result<TaskResult, EngineError> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::SessionReused);
        }
        options.validate()?;
        plan.validate()?;

        let started = Instant::now();
        tracing::info!(
            session = %self.id,
            steps = plan.len(),
            observer = options.enable_observer,
            "session started"
        );

        let observer = self.observer(&options)?;
        if let Some(obs) = &observer {
            obs.start(&self.cancel);
        }

        let recovery = RecoveryController::new(Arc::clone(&self.invoker), Arc::clone(&self.diagnostics))
            .with_sampler(self.sampler.clone())
            .with_store(observer.as_ref().map(|o| o.store().clone()))
            .with_max_attempts(options.max_attempts_per_step)
            .with_diagnosis_timeout(self.settings.diagnosis_timeout)
            .with_events(self.status_tx.clone());
        let driver = StepDriver::new(Arc::clone(&self.invoker), recovery, self.cancel.clone())
            .with_events(self.status_tx.clone());

        let outcome = driver.run(plan).await;

        let learning = match observer {
            Some(obs) => {
                obs.stop().await;
                Some(self.store.learning_summary())
            }
            None => None,
        };

        let mut result = TaskResult::from_steps(
            self.id.clone(),
            plan.summary.clone(),
            outcome.steps,
            outcome.cancelled,
            started.elapsed().as_millis() as u64,
        );
        result.learning = learning;

        tracing::info!(
            session = %self.id,
            success = result.success,
            cancelled = result.cancelled,
            elapsed_ms = result.elapsed_ms,
            "{}",
            result.summary
        );
        send_event(
            &self.status_tx,
            SessionEvent::SessionFinished {
                success: result.success,
                cancelled: result.cancelled,
            },
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::diagnostics::LlmDiagnostics;
    use crate::core::{Args, PlannedStep};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Ok200;

    #[async_trait]
    impl ToolInvoker for Ok200 {
        async fn invoke(&self, _: &str, _: &Args) -> Result<Value, EngineError> {
            Ok(json!({"status": 200}))
        }
    }

    fn session() -> TaskSession {
        TaskSession::new(
            Arc::new(Ok200),
            Arc::new(LlmDiagnostics::new(Arc::new(MockLlmClient::new()))),
        )
    }

    fn one_step() -> Plan {
        Plan::new("t", vec![PlannedStep::new("a", "click", Args::new())])
    }

    #[test]
    fn test_options_validation() {
        assert!(SessionOptions::default().validate().is_ok());
        let zero = SessionOptions {
            max_attempts_per_step: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(EngineError::Config(_))));
        let nan = SessionOptions {
            observation_interval_secs: f64::NAN,
            ..Default::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_options_from_config() {
        let mut cfg = AppConfig::default();
        cfg.observer.enabled = true;
        cfg.engine.max_attempts_per_step = 3;
        let opts = SessionOptions::from_config(&cfg);
        assert!(opts.enable_observer);
        assert_eq!(opts.max_attempts_per_step, 3);
    }

    #[tokio::test]
    async fn test_session_runs_once() {
        let s = session();
        let result = s.execute(&one_step(), SessionOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.session_id, s.id());
        assert!(result.learning.is_none());
        assert_eq!(
            s.execute(&one_step(), SessionOptions::default()).await.unwrap_err(),
            EngineError::SessionReused
        );
    }

    #[tokio::test]
    async fn test_observer_requires_sampler() {
        let opts = SessionOptions {
            enable_observer: true,
            ..Default::default()
        };
        let err = session().execute(&one_step(), opts).await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}

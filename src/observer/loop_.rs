//! 观察循环：独立于步骤节奏的周期性屏幕理解
//!
//! Idle → Running（start）→ Idle（stop 或父 token 取消）。每个周期：采样 → 检测 → 构建上下文 →
//! 屏幕理解 → 写入历史与模式表 → 发出建议/问题事件 → 睡到周期结束。
//! 取消只在睡眠边界生效，进行中的采样与理解调用会完成（理解调用受超时约束）。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::SessionEvent;
use crate::diagnostics::{DiagnosticService, ObservationDigest, UnderstandRequest};
use crate::observer::{ElementDetector, Observation, ObservationStore, StateSampler};

/// 观察循环参数
#[derive(Debug, Clone)]
pub struct ObserverSettings {
    pub interval: Duration,
    /// 理解请求带入的最近观察条数
    pub context_observations: usize,
    /// 理解请求带入的检测元素上限
    pub context_elements: usize,
    pub understand_timeout: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            context_observations: 3,
            context_elements: 10,
            understand_timeout: Duration::from_secs(60),
        }
    }
}

struct Worker {
    sampler: Arc<dyn StateSampler>,
    detector: Option<Arc<dyn ElementDetector>>,
    diagnostics: Arc<dyn DiagnosticService>,
    store: ObservationStore,
    settings: ObserverSettings,
    events: broadcast::Sender<SessionEvent>,
}

impl Worker {
    async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!(interval_ms = self.settings.interval.as_millis() as u64, "observer started");
        loop {
            if token.is_cancelled() {
                break;
            }
            let started = Instant::now();
            self.cycle().await;
            let wait = self.settings.interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!(observations = self.store.total_recorded(), "observer stopped");
    }

    async fn cycle(&self) {
        let cycle_started = Utc::now();
        let snapshot = match self.sampler.capture().await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "observer snapshot failed");
                None
            }
        };

        let elements = match (&self.detector, &snapshot) {
            (Some(detector), Some(snap)) => detector.detect(snap).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "element detection failed");
                Vec::new()
            }),
            _ => Vec::new(),
        };

        let request = UnderstandRequest {
            snapshot: snapshot.clone(),
            recent: self
                .store
                .recent(self.settings.context_observations)
                .iter()
                .map(|o| ObservationDigest {
                    timestamp: o.timestamp,
                    analysis: o.analysis.clone(),
                })
                .collect(),
            elements: elements
                .iter()
                .take(self.settings.context_elements)
                .cloned()
                .collect(),
        };

        let understanding = match tokio::time::timeout(
            self.settings.understand_timeout,
            self.diagnostics.understand(&request),
        )
        .await
        {
            Ok(Ok(u)) => u,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "screen understanding failed, cycle skipped");
                return;
            }
            Err(_) => {
                tracing::warn!("screen understanding timed out, cycle skipped");
                return;
            }
        };

        // 观察按采样时刻排序，而不是理解调用返回的时刻
        let at = snapshot
            .as_ref()
            .map(|s| s.captured_at)
            .unwrap_or(cycle_started);
        let next_action = understanding.next_action.clone();
        let issues = understanding.issues.clone();
        let total = self.store.record(Observation {
            seq: 0,
            timestamp: at,
            snapshot: snapshot.map(|s| s.reference),
            elements,
            analysis: understanding.analysis,
            state: understanding.state,
            next_action: understanding.next_action,
            confidence: understanding.confidence,
            issues: understanding.issues,
            patterns: understanding.patterns,
        });
        tracing::debug!(total, "observation recorded");

        let _ = self.events.send(SessionEvent::ObservationRecorded { total });
        if let Some(action) = next_action {
            let _ = self.events.send(SessionEvent::Suggestion { action, at });
        }
        if !issues.is_empty() {
            tracing::info!(?issues, "observer detected issues");
            let _ = self.events.send(SessionEvent::IssuesDetected { issues, at });
        }
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 后台观察循环；唯一写入 ObservationStore 的角色
pub struct ObserverLoop {
    worker: Arc<Worker>,
    running: Mutex<Option<Running>>,
}

impl ObserverLoop {
    pub fn new(
        sampler: Arc<dyn StateSampler>,
        detector: Option<Arc<dyn ElementDetector>>,
        diagnostics: Arc<dyn DiagnosticService>,
        store: ObservationStore,
        settings: ObserverSettings,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                sampler,
                detector,
                diagnostics,
                store,
                settings,
                events,
            }),
            running: Mutex::new(None),
        }
    }

    /// 在父 token 的子 token 下启动；已在运行时返回 false
    pub fn start(&self, parent: &CancellationToken) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        let token = parent.child_token();
        let handle = tokio::spawn(Arc::clone(&self.worker).run(token.clone()));
        *running = Some(Running { token, handle });
        true
    }

    /// 停止并等待后台任务退出
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(Running { token, handle }) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "observer task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    pub fn store(&self) -> &ObservationStore {
        &self.worker.store
    }

    pub fn latest(&self) -> Option<Arc<Observation>> {
        self.worker.store.latest()
    }

    pub fn history(&self) -> Vec<Arc<Observation>> {
        self.worker.store.history()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.worker.events.subscribe()
    }
}

impl Drop for ObserverLoop {
    fn drop(&mut self) {
        if let Some(r) = self.running.get_mut().ok().and_then(|r| r.as_ref()) {
            r.token.cancel();
        }
    }
}

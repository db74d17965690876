//! 观察历史与模式表（会话级）
//!
//! 有界环形缓冲：超出上限时淘汰最旧，顺序永不改变；模式表只增不减。
//! 观察循环是唯一写者，步骤驱动器与恢复控制器只读 latest()/history()。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::observer::DetectedElement;

/// 一次观察；写入历史后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// 本会话内的序号（从 1 开始，写入时分配）
    #[serde(default)]
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// 快照引用（采样失败时为空）
    pub snapshot: Option<String>,
    #[serde(default)]
    pub elements: Vec<DetectedElement>,
    pub analysis: String,
    pub state: String,
    pub next_action: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Observation {
    pub fn new(analysis: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            snapshot: None,
            elements: Vec::new(),
            analysis: analysis.into(),
            state: "unknown".to_string(),
            next_action: None,
            confidence: 0.0,
            issues: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub first_seen: DateTime<Utc>,
    pub count: u64,
}

/// 模式标签 → 首次出现时间与次数
#[derive(Debug, Clone, Default)]
pub struct PatternTable {
    entries: HashMap<String, PatternStats>,
}

impl PatternTable {
    /// 已有则计数加一，否则以 1 插入
    pub fn observe(&mut self, pattern: &str, at: DateTime<Utc>) {
        self.entries
            .entry(pattern.to_string())
            .and_modify(|s| s.count += 1)
            .or_insert(PatternStats {
                first_seen: at,
                count: 1,
            });
    }

    pub fn get(&self, pattern: &str) -> Option<PatternStats> {
        self.entries.get(pattern).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 次数降序，次数相同按首次出现升序
    pub fn top(&self, n: usize) -> Vec<PatternCount> {
        let mut all: Vec<(&String, &PatternStats)> = self.entries.iter().collect();
        all.sort_by(|a, b| {
            b.1.count
                .cmp(&a.1.count)
                .then(a.1.first_seen.cmp(&b.1.first_seen))
                .then(a.0.cmp(b.0))
        });
        all.into_iter()
            .take(n)
            .map(|(pattern, stats)| PatternCount {
                pattern: pattern.clone(),
                count: stats.count,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCount {
    pub pattern: String,
    pub count: u64,
}

/// 观察学习统计：只含计数与模式标签
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSummary {
    /// 本会话累计写入的观察数（含已淘汰的）
    pub total_observations: u64,
    /// 当前保留在历史中的条数
    pub retained_observations: usize,
    pub patterns_learned: usize,
    pub top_patterns: Vec<PatternCount>,
    /// 保留历史中最早到最新观察的时间跨度
    pub observation_span_secs: Option<f64>,
}

const TOP_PATTERNS: usize = 5;

#[derive(Debug)]
struct Inner {
    history: VecDeque<Arc<Observation>>,
    patterns: PatternTable,
    total_recorded: u64,
}

/// 会话级观察存储，可克隆共享（内部 Arc）
#[derive(Debug, Clone)]
pub struct ObservationStore {
    inner: Arc<RwLock<Inner>>,
    limit: usize,
}

impl ObservationStore {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                history: VecDeque::with_capacity(limit.min(1024)),
                patterns: PatternTable::default(),
                total_recorded: 0,
            })),
            limit,
        }
    }

    // 写者 panic 不影响读者：锁中毒时继续使用内部数据
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 追加一条观察并合并其模式，返回本会话累计条数
    ///
    /// 时间戳早于上一条时钳到上一条，保证历史按时间单调。
    pub fn record(&self, mut observation: Observation) -> u64 {
        let mut inner = self.write();
        if let Some(last) = inner.history.back() {
            if observation.timestamp < last.timestamp {
                observation.timestamp = last.timestamp;
            }
        }
        inner.total_recorded += 1;
        observation.seq = inner.total_recorded;

        for pattern in observation.patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            inner.patterns.observe(pattern, observation.timestamp);
        }

        inner.history.push_back(Arc::new(observation));
        while inner.history.len() > self.limit {
            inner.history.pop_front();
        }
        inner.total_recorded
    }

    pub fn latest(&self) -> Option<Arc<Observation>> {
        self.read().history.back().cloned()
    }

    /// 按时间顺序的全部保留历史
    pub fn history(&self) -> Vec<Arc<Observation>> {
        self.read().history.iter().cloned().collect()
    }

    /// 最近 n 条，按时间顺序
    pub fn recent(&self, n: usize) -> Vec<Arc<Observation>> {
        let inner = self.read();
        let skip = inner.history.len().saturating_sub(n);
        inner.history.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().history.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.read().total_recorded
    }

    pub fn pattern(&self, pattern: &str) -> Option<PatternStats> {
        self.read().patterns.get(pattern)
    }

    pub fn pattern_count(&self) -> usize {
        self.read().patterns.len()
    }

    pub fn learning_summary(&self) -> LearningSummary {
        let inner = self.read();
        let span = match (inner.history.front(), inner.history.back()) {
            (Some(first), Some(last)) => {
                Some((last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        LearningSummary {
            total_observations: inner.total_recorded,
            retained_observations: inner.history.len(),
            patterns_learned: inner.patterns.len(),
            top_patterns: inner.patterns.top(TOP_PATTERNS),
            observation_span_secs: span,
        }
    }
}

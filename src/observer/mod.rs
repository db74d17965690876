//! 观察层：状态采样、会话级观察历史与后台观察循环

pub mod loop_;
pub mod sampler;
pub mod store;

pub use loop_::{ObserverLoop, ObserverSettings};
pub use sampler::{DetectedElement, ElementDetector, Region, Snapshot, StateSampler, ToolStateSampler};
pub use store::{
    LearningSummary, Observation, ObservationStore, PatternCount, PatternStats, PatternTable,
};

//! 核心执行层：计划与步骤记录、步骤驱动器、恢复控制器、任务会话与事件

pub mod driver;
pub mod error;
pub mod events;
pub mod plan;
pub mod recovery;
pub mod session;

pub use driver::{DriverOutcome, StepDriver};
pub use error::EngineError;
pub use events::SessionEvent;
pub use plan::{Args, Plan, PlannedStep, RecoveryRecord, Step, StepStatus, TaskResult};
pub use recovery::RecoveryController;
pub use session::{EngineSettings, SessionOptions, TaskSession};

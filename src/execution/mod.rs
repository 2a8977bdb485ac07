// Order execution and position tracking module
pub mod executor;
pub mod exit_policy;
pub mod position_manager;

pub use executor::{Execution, ExecutionError, Executor, ExecutorConfig, Protection};
pub use exit_policy::{ExitPlan, ExitPolicy, ExitReason, ExitTier};
pub use position_manager::{PositionError, PositionManager, DEFAULT_FEE_RATE};

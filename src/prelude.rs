//! Commonly used types and traits

pub use crate::chain::{Chain, ChainBuilder, StepInfo};
pub use crate::context::{StepContext, StepState};
pub use crate::error::{ChainBuildError, ContractError, StepError};
pub use crate::execution::ExecutionBuilder;
pub use crate::item::{Item, ItemId, MultiItem, SingleItem, ValueItem};
pub use crate::result::{ExecutionResult, Failure, StepSummary, Success};
pub use crate::runner::{BlockingPool, CurrentThread, TaskRunner};
pub use crate::step::{ConsumeFlags, ProduceFlags, Step, StepBuilder, StepId};
pub use crate::{marker_item, multi_item, single_item};

use crate::item::ItemId;
use crate::step::StepId;
use thiserror::Error;

/// Boxed error type carried by failed steps.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while assembling a [`Chain`](crate::Chain).
///
/// All variants are fatal to [`ChainBuilder::build`](crate::ChainBuilder::build);
/// no partial chain is ever returned.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChainBuildError {
    /// More than one real producer was declared for a single-valued item,
    /// and the pair is not one overridable plus one non-overridable
    /// producer.
    #[error("multiple producers declared for item {item} (step {step})")]
    MultipleProducers {
        /// The item with conflicting producers
        item: ItemId,
        /// The step whose declaration triggered the conflict
        step: StepId,
    },

    /// A real producer was declared for an item already marked initial.
    ///
    /// Initial items are supplied by the caller through
    /// [`ExecutionBuilder::provide`](crate::ExecutionBuilder::provide);
    /// steps may not produce them.
    #[error("cannot produce initial item {item} (step {step})")]
    ProducesInitial {
        /// The initial item
        item: ItemId,
        /// The step that tried to produce it
        step: StepId,
    },

    /// An included step consumes a required item that nothing produces.
    ///
    /// Raised for consumed items that are not optional, not multi-valued,
    /// and not declared initial.
    #[error("no producers for required item {item}")]
    NoProducers {
        /// The unsatisfiable item
        item: ItemId,
    },

    /// The dependency relation among included steps contains a cycle.
    ///
    /// The rendered path lists the produce edges that close the loop.
    #[error("cycle detected:{path}")]
    Cycle {
        /// Human-readable rendering of the offending edge path
        path: String,
    },
}

/// Produce/consume contract violations.
///
/// These are programming errors in how an item store was used: producing
/// outside the running state, touching an undeclared item, or writing a
/// single-valued item twice. Inside a step body they surface through
/// [`StepError`]; on [`ExecutionBuilder`](crate::ExecutionBuilder) they
/// are returned directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContractError {
    /// Produce or consume was called while the step was not running.
    #[error("step is not running")]
    NotRunning,

    /// The item was not declared by this step (or chain).
    #[error("undeclared item: {0}")]
    UndeclaredItem(ItemId),

    /// A second value was supplied for a single-valued item.
    #[error("cannot provide multiple values for item {0}")]
    DuplicateValue(ItemId),

    /// A required single value was never produced.
    #[error("no value available for item {0}")]
    MissingValue(ItemId),

    /// The stored value does not have the requested type.
    #[error("stored value for item {0} has an unexpected type")]
    TypeMismatch(ItemId),
}

/// The error type returned by step bodies.
///
/// A step fails either because it misused the item stores
/// ([`StepError::Contract`]) or because its own logic failed
/// ([`StepError::Failed`]). Either way the error is captured into the
/// run's problem list and the execution finishes as a
/// [`Failure`](crate::Failure); it is never rethrown to the caller of
/// [`ExecutionBuilder::execute`](crate::ExecutionBuilder::execute).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StepError {
    /// An item-store contract violation.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// The step's own logic failed.
    #[error("step failed: {0}")]
    Failed(#[source] BoxError),
}

impl StepError {
    /// Wrap an arbitrary error as a step failure.
    ///
    /// Accepts anything convertible into a boxed error, including plain
    /// strings:
    ///
    /// ```
    /// use kumihimo::StepError;
    ///
    /// let err = StepError::failed("flux capacitor offline");
    /// assert_eq!(err.to_string(), "step failed: flux capacitor offline");
    /// ```
    pub fn failed(error: impl Into<BoxError>) -> Self {
        StepError::Failed(error.into())
    }
}

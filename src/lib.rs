//! # Kumihimo (組紐)
//!
//! A dependency-graph step engine for Rust.
//!
//! The name "Kumihimo" (組紐) refers to the Japanese craft of braiding
//! many strands into a single cord, which is what this engine does with
//! tasks: steps declare the typed items they produce and consume, the
//! builder braids those declarations into a pruned dependency graph, and
//! the engine executes the graph concurrently.
//!
//! ## Features
//!
//! - **Declarative wiring**: steps declare *what* they exchange
//!   ([`ItemId`]s), never *who* they run after; ordering falls out of
//!   the producer/consumer graph
//! - **Pruning**: only steps reachable from the requested final items are
//!   built and executed
//! - **Validation**: duplicate producers, missing producers and
//!   dependency cycles are build-time errors, before anything runs
//! - **Concurrent execution**: dependency-countdown scheduling over a
//!   caller-supplied [`TaskRunner`], with failure propagation and
//!   skip-on-failure semantics
//! - **Typed results**: a run always ends in a [`Success`] with typed
//!   lookups or a [`Failure`] with the captured problems
//!
//! ## Quick Start
//!
//! ```
//! use kumihimo::{Chain, CurrentThread};
//!
//! #[derive(Debug)]
//! struct Greeting(String);
//! kumihimo::single_item!(Greeting);
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut builder = Chain::builder();
//! builder
//!     .add_raw_step(|ctx| ctx.produce(Greeting("hello".into())))
//!     .produces::<Greeting>()
//!     .build();
//! builder.add_final::<Greeting>();
//! let chain = builder.build().expect("valid chain");
//!
//! let result = chain.execution_builder().execute(CurrentThread).await;
//! let success = result.as_success().expect("run succeeded");
//! assert_eq!(success.consume::<Greeting>().expect("produced").0, "hello");
//! # }
//! ```
//!
//! ## Linked Steps
//!
//! Steps never reference each other; consuming an item is what creates
//! the edge:
//!
//! ```
//! use kumihimo::{Chain, CurrentThread};
//!
//! #[derive(Debug)]
//! struct Raw(u32);
//! kumihimo::single_item!(Raw);
//!
//! #[derive(Debug)]
//! struct Cooked(u32);
//! kumihimo::single_item!(Cooked);
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut builder = Chain::builder();
//! builder
//!     .add_raw_step(|ctx| ctx.produce(Raw(6)))
//!     .produces::<Raw>()
//!     .build();
//! builder
//!     .add_raw_step(|ctx| {
//!         let raw = ctx.consume::<Raw>()?;
//!         ctx.produce(Cooked(raw.0 * 7))
//!     })
//!     .consumes::<Raw>()
//!     .produces::<Cooked>()
//!     .build();
//! builder.add_final::<Cooked>();
//! let chain = builder.build().expect("valid chain");
//!
//! let result = chain.execution_builder().execute(CurrentThread).await;
//! assert_eq!(
//!     result.as_success().expect("ok").consume::<Cooked>().expect("produced").0,
//!     42
//! );
//! # }
//! ```
//!
//! ## Parallel Execution
//!
//! The engine schedules steps the moment their dependencies finish; hand
//! it a [`BlockingPool`] and independent steps run in parallel:
//!
//! ```
//! # use kumihimo::{BlockingPool, Chain};
//! # #[derive(Debug)]
//! # struct Out(u32);
//! # kumihimo::single_item!(Out);
//! # #[tokio::main(flavor = "multi_thread")]
//! # async fn main() {
//! # let mut builder = Chain::builder();
//! # builder
//! #     .add_raw_step(|ctx| ctx.produce(Out(1)))
//! #     .produces::<Out>()
//! #     .build();
//! # builder.add_final::<Out>();
//! # let chain = builder.build().expect("valid chain");
//! let runner = BlockingPool::current().expect("inside a tokio runtime");
//! let result = chain.execution_builder().execute(runner).await;
//! # assert!(result.is_success());
//! # }
//! ```
//!
//! ## Failure Handling
//!
//! A step failure never panics and never hangs the run: steps that were
//! already running finish, everything not yet started is skipped, and
//! the run resolves to a [`Failure`] carrying the original errors:
//!
//! ```
//! use kumihimo::{Chain, CurrentThread, StepError};
//!
//! #[derive(Debug)]
//! struct Never;
//! kumihimo::single_item!(Never);
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut builder = Chain::builder();
//! builder
//!     .add_raw_step(|_ctx| Err(StepError::failed("out of cheese")))
//!     .produces::<Never>()
//!     .build();
//! builder.add_final::<Never>();
//! let chain = builder.build().expect("valid chain");
//!
//! let result = chain.execution_builder().execute(CurrentThread).await;
//! let failure = result.as_failure().expect("run failed");
//! assert_eq!(failure.problems().len(), 1);
//! # }
//! ```

mod chain;
mod context;
mod error;
mod execution;
mod item;
mod result;
mod runner;
mod step;

pub mod prelude;

pub use chain::{Chain, ChainBuilder, StepInfo, GRAPH_OUTPUT_ENV};
pub use context::{StepContext, StepState};
pub use error::{BoxError, ChainBuildError, ContractError, StepError};
pub use execution::ExecutionBuilder;
pub use item::{Item, ItemId, MultiItem, SingleItem, ValueItem};
pub use result::{ExecutionResult, Failure, RunReport, StepSummary, Success};
pub use runner::{BlockingPool, CurrentThread, TaskRunner, Work};
pub use step::{
    Constraint, ConsumeFlags, ProduceFlags, Step, StepBuilder, StepFn,
    StepId, StepIdKind,
};

/// Declare a type as a single-valued item.
///
/// Implements [`Item`], [`ValueItem`] and [`SingleItem`] for the type:
/// at most one value per [`ItemId`] may exist during a run.
///
/// # Example
///
/// ```
/// #[derive(Debug)]
/// struct Config(String);
/// kumihimo::single_item!(Config);
/// ```
#[macro_export]
macro_rules! single_item {
    ($ty:ty) => {
        impl $crate::Item for $ty {}
        impl $crate::ValueItem for $ty {}
        impl $crate::SingleItem for $ty {}
    };
}

/// Declare a type as a multi-valued item.
///
/// Values accumulate into a list instead of overwriting. The `ordered`
/// form additionally keeps the list sorted by the type's [`Ord`]
/// implementation as values are inserted.
///
/// # Example
///
/// ```
/// #[derive(Debug)]
/// struct LogLine(String);
/// kumihimo::multi_item!(LogLine);
///
/// #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
/// struct Priority(u8);
/// kumihimo::multi_item!(Priority, ordered);
/// ```
#[macro_export]
macro_rules! multi_item {
    ($ty:ty) => {
        impl $crate::Item for $ty {
            fn multi() -> bool
            where
                Self: Sized,
            {
                true
            }
        }
        impl $crate::ValueItem for $ty {}
        impl $crate::MultiItem for $ty {}
    };
    ($ty:ty, ordered) => {
        impl $crate::Item for $ty {
            fn multi() -> bool
            where
                Self: Sized,
            {
                true
            }
        }
        impl $crate::ValueItem for $ty {}
        impl $crate::MultiItem for $ty {
            const ORDERED: bool = true;
            fn compare(&self, other: &Self) -> ::core::cmp::Ordering {
                ::core::cmp::Ord::cmp(self, other)
            }
        }
    };
}

/// Declare a type as a marker item.
///
/// Marker items carry no value; they exist purely for order-only edges
/// ([`StepBuilder::before_consume`] / [`StepBuilder::after_produce`]).
/// Producing or consuming one for its value does not compile.
///
/// # Example
///
/// ```
/// #[derive(Debug)]
/// struct SchemaReady;
/// kumihimo::marker_item!(SchemaReady);
/// ```
#[macro_export]
macro_rules! marker_item {
    ($ty:ty) => {
        impl $crate::Item for $ty {}
    };
}

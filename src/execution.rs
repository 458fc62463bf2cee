use crate::chain::Chain;
use crate::context::StepContext;
use crate::error::{ContractError, StepError};
use crate::item::{insert_value, Item, ItemId, MultiItem, SingleItem};
use crate::result::{ExecutionResult, Failure, RunReport, StepSummary, Success};
use crate::runner::TaskRunner;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Binds initial item values to a [`Chain`] and starts executions.
///
/// Obtained from [`Chain::execution_builder`]. Every initial item the
/// chain's steps require must be provided before
/// [`execute`](ExecutionBuilder::execute) is called.
///
/// # Examples
///
/// ```
/// use kumihimo::{Chain, CurrentThread};
///
/// #[derive(Debug)]
/// struct Input(u32);
/// kumihimo::single_item!(Input);
///
/// #[derive(Debug)]
/// struct Doubled(u32);
/// kumihimo::single_item!(Doubled);
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut builder = Chain::builder();
/// builder.add_initial::<Input>();
/// builder
///     .add_raw_step(|ctx| {
///         let input = ctx.consume::<Input>()?;
///         ctx.produce(Doubled(input.0 * 2))
///     })
///     .consumes::<Input>()
///     .produces::<Doubled>()
///     .build();
/// builder.add_final::<Doubled>();
/// let chain = builder.build().expect("valid chain");
///
/// let mut execution = chain.execution_builder();
/// execution.provide(Input(21)).expect("declared initial");
/// let result = execution.execute(CurrentThread).await;
/// let success = result.as_success().expect("run succeeded");
/// assert_eq!(success.consume::<Doubled>().unwrap().0, 42);
/// # }
/// ```
pub struct ExecutionBuilder {
    chain: Chain,
    initial_single: HashMap<ItemId, Arc<dyn Item>>,
    initial_multi: HashMap<ItemId, Vec<Arc<dyn Item>>>,
}

impl ExecutionBuilder {
    pub(crate) fn new(chain: Chain) -> Self {
        let initial_single = HashMap::with_capacity(chain.initial_single_count());
        let initial_multi = HashMap::with_capacity(chain.initial_multi_count());
        Self {
            chain,
            initial_single,
            initial_multi,
        }
    }

    /// Provide the value of a single-valued initial item.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractError`] if the chain did not declare `T` as
    /// initial or a value was already provided.
    pub fn provide<T: SingleItem>(&mut self, value: T) -> Result<&mut Self, ContractError> {
        self.provide_single(ItemId::of::<T>(), Arc::new(value))
    }

    /// [`provide`](ExecutionBuilder::provide) for an item discriminated
    /// by argument type `A`.
    pub fn provide_for<T: SingleItem, A: Any>(
        &mut self,
        value: T,
    ) -> Result<&mut Self, ContractError> {
        self.provide_single(ItemId::of_arg::<T, A>(), Arc::new(value))
    }

    /// Provide one value of a multi-valued initial item.
    ///
    /// May be called any number of times; values accumulate, sorted when
    /// `T` declares an ordering.
    pub fn provide_multi<T: MultiItem>(&mut self, value: T) -> Result<&mut Self, ContractError> {
        self.provide_multi_at(ItemId::of::<T>(), Arc::new(value))
    }

    /// [`provide_multi`](ExecutionBuilder::provide_multi) for an item
    /// discriminated by argument type `A`.
    pub fn provide_multi_for<T: MultiItem, A: Any>(
        &mut self,
        value: T,
    ) -> Result<&mut Self, ContractError> {
        self.provide_multi_at(ItemId::of_arg::<T, A>(), Arc::new(value))
    }

    /// Run the chain on the given task runner.
    ///
    /// Start steps are submitted immediately; the returned future
    /// resolves once every reachable step has finished. Step failures do
    /// not fail the future; they surface as an
    /// [`ExecutionResult::Failure`]. Dropping the future abandons the
    /// run.
    pub async fn execute(self, runner: impl TaskRunner + 'static) -> ExecutionResult {
        Execution::run(self, Box::new(runner)).await
    }

    fn provide_single(
        &mut self,
        id: ItemId,
        value: Arc<dyn Item>,
    ) -> Result<&mut Self, ContractError> {
        if !self.chain.has_initial(&id) {
            return Err(ContractError::UndeclaredItem(id));
        }
        match self.initial_single.entry(id) {
            Entry::Occupied(_) => Err(ContractError::DuplicateValue(id)),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(self)
            }
        }
    }

    fn provide_multi_at<T: MultiItem>(
        &mut self,
        id: ItemId,
        value: Arc<T>,
    ) -> Result<&mut Self, ContractError> {
        if !self.chain.has_initial(&id) {
            return Err(ContractError::UndeclaredItem(id));
        }
        insert_value(self.initial_multi.entry(id).or_default(), value);
        Ok(self)
    }
}

/// The shared state of one run: the concurrent item stores, the live
/// step-context cache, the problem list and the completion countdown.
///
/// Created fresh per [`ExecutionBuilder::execute`] call and discarded
/// after producing an [`ExecutionResult`].
pub(crate) struct Execution {
    chain: Chain,
    runner: Box<dyn TaskRunner>,
    singles: DashMap<ItemId, Arc<dyn Item>>,
    multis: DashMap<ItemId, Vec<Arc<dyn Item>>>,
    contexts: DashMap<usize, Arc<StepContext>>,
    problems: Mutex<Vec<StepError>>,
    error_reported: AtomicBool,
    remaining_end_steps: AtomicUsize,
    summaries: Mutex<HashMap<crate::step::StepId, StepSummary>>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl Execution {
    async fn run(builder: ExecutionBuilder, runner: Box<dyn TaskRunner>) -> ExecutionResult {
        let started_at = SystemTime::now();
        let started = Instant::now();
        let chain = builder.chain.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let execution = Arc::new(Execution {
            chain: chain.clone(),
            runner,
            singles: builder.initial_single.into_iter().collect(),
            multis: builder.initial_multi.into_iter().collect(),
            contexts: DashMap::new(),
            problems: Mutex::new(Vec::new()),
            error_reported: AtomicBool::new(false),
            remaining_end_steps: AtomicUsize::new(chain.end_step_count()),
            summaries: Mutex::new(HashMap::new()),
            done: Mutex::new(Some(done_tx)),
        });
        if chain.end_step_count() > 0 {
            debug!(
                steps = chain.step_count(),
                start_steps = chain.start_indices().len(),
                "starting execution"
            );
            for &index in chain.start_indices() {
                Execution::submit(&execution, index);
            }
            // The sender lives in `execution`, which we hold; an error
            // here is unreachable and treated as completion.
            let _ = done_rx.await;
        }
        Execution::collect(&execution, started_at, started.elapsed())
    }

    fn collect(
        execution: &Arc<Execution>,
        started_at: SystemTime,
        elapsed: Duration,
    ) -> ExecutionResult {
        let summaries = std::mem::take(&mut *execution.summaries.lock());
        let report = RunReport::new(started_at, SystemTime::now(), elapsed, summaries);
        if execution.error_reported.load(Ordering::Acquire) {
            let problems = std::mem::take(&mut *execution.problems.lock());
            debug!(problems = problems.len(), "execution failed");
            ExecutionResult::Failure(Failure::new(report, problems))
        } else {
            let remaining = execution.remaining_end_steps.load(Ordering::Acquire);
            assert!(remaining == 0, "{remaining} end steps left over after run completion");
            let singles = execution
                .singles
                .iter()
                .map(|entry| (*entry.key(), Arc::clone(entry.value())))
                .collect();
            let multis = execution
                .multis
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect();
            debug!(elapsed = ?elapsed, "execution succeeded");
            ExecutionResult::Success(Success::new(report, singles, multis))
        }
    }

    /// The cached context for a step, created on first reference.
    pub(crate) fn context(execution: &Arc<Execution>, index: usize) -> Arc<StepContext> {
        execution
            .contexts
            .entry(index)
            .or_insert_with(|| {
                Arc::new(StepContext::new(
                    Arc::clone(execution),
                    Arc::clone(execution.chain.step_at(index)),
                ))
            })
            .value()
            .clone()
    }

    /// Hand a step to the task runner.
    pub(crate) fn submit(execution: &Arc<Execution>, index: usize) {
        let context = Execution::context(execution, index);
        execution.runner.run(Box::new(move || context.run()));
    }

    pub(crate) fn evict_context(&self, index: usize) {
        self.contexts.remove(&index);
    }

    pub(crate) fn chain(&self) -> &Chain {
        &self.chain
    }

    pub(crate) fn runner(&self) -> &dyn TaskRunner {
        self.runner.as_ref()
    }

    pub(crate) fn singles(&self) -> &DashMap<ItemId, Arc<dyn Item>> {
        &self.singles
    }

    pub(crate) fn multis(&self) -> &DashMap<ItemId, Vec<Arc<dyn Item>>> {
        &self.multis
    }

    pub(crate) fn is_error_reported(&self) -> bool {
        self.error_reported.load(Ordering::Acquire)
    }

    pub(crate) fn set_error_reported(&self) {
        self.error_reported.store(true, Ordering::Release);
    }

    pub(crate) fn report_problem(&self, problem: StepError) {
        self.problems.lock().push(problem);
        self.set_error_reported();
    }

    pub(crate) fn archive_summary(&self, summary: StepSummary) {
        self.summaries
            .lock()
            .insert(summary.step_id().clone(), summary);
    }

    /// Called when a step with no dependents finishes; the last one
    /// signals the driver.
    pub(crate) fn end_step_finished(&self) {
        let remaining = self.remaining_end_steps.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(remaining, "end step finished");
        if remaining == 0 {
            if let Some(done) = self.done.lock().take() {
                let _ = done.send(());
            }
        }
    }
}

use crate::context::StepState;
use crate::error::{ContractError, StepError};
use crate::item::{downcast_item, Item, ItemId, MultiItem, SingleItem};
use crate::step::StepId;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::warn;

/// The summary of a single step's execution: identity, terminal state
/// and timing.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    step_id: StepId,
    state: StepState,
    started_at: SystemTime,
    finished_at: SystemTime,
}

impl StepSummary {
    /// Construct a new summary.
    pub fn new(
        step_id: StepId,
        state: StepState,
        started_at: SystemTime,
        finished_at: SystemTime,
    ) -> Self {
        Self {
            step_id,
            state,
            started_at,
            finished_at,
        }
    }

    /// The step's identifier.
    pub fn step_id(&self) -> &StepId {
        &self.step_id
    }

    /// The step's terminal state.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// When the step was picked up by the runner.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// When the step reached its terminal state.
    pub fn finished_at(&self) -> SystemTime {
        self.finished_at
    }

    /// Elapsed time between start and finish (zero if the clock went
    /// backwards).
    pub fn duration(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

/// Timing and per-step reporting shared by [`Success`] and [`Failure`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    started_at: SystemTime,
    finished_at: SystemTime,
    duration: Duration,
    summaries: HashMap<StepId, StepSummary>,
}

impl RunReport {
    pub(crate) fn new(
        started_at: SystemTime,
        finished_at: SystemTime,
        duration: Duration,
        summaries: HashMap<StepId, StepSummary>,
    ) -> Self {
        Self {
            started_at,
            finished_at,
            duration,
            summaries,
        }
    }

    /// When the run was initiated.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// When the run completed.
    pub fn finished_at(&self) -> SystemTime {
        self.finished_at
    }

    /// Elapsed time from initiation to completion.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The summary of one step, if it reached a terminal state.
    pub fn summary(&self, id: &StepId) -> Option<&StepSummary> {
        self.summaries.get(id)
    }

    /// Summaries of every step that reached a terminal state.
    pub fn summaries(&self) -> impl Iterator<Item = &StepSummary> {
        self.summaries.values()
    }

    /// Identifiers of the steps that actually executed: completed or
    /// failed, but not skipped.
    pub fn executed_steps(&self) -> impl Iterator<Item = &StepId> {
        self.summaries.values().filter_map(|summary| {
            matches!(summary.state(), StepState::Complete | StepState::Failed)
                .then(|| summary.step_id())
        })
    }
}

/// The outcome of one execution: either [`Success`] with the produced
/// values or [`Failure`] with the captured problems.
///
/// A run always terminates in one of these; ordinary step failures never
/// surface as errors from
/// [`ExecutionBuilder::execute`](crate::ExecutionBuilder::execute).
#[derive(Debug)]
pub enum ExecutionResult {
    /// Every executed step completed.
    Success(Success),
    /// At least one step failed (or the error flag was raised).
    Failure(Failure),
}

impl ExecutionResult {
    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    /// Whether the run failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionResult::Failure(_))
    }

    /// This result as a success, if it is one.
    pub fn as_success(&self) -> Option<&Success> {
        match self {
            ExecutionResult::Success(success) => Some(success),
            ExecutionResult::Failure(_) => None,
        }
    }

    /// This result as a failure, if it is one.
    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            ExecutionResult::Failure(failure) => Some(failure),
            ExecutionResult::Success(_) => None,
        }
    }

    /// Unwrap into the success, or the failure as an error.
    pub fn into_success(self) -> Result<Success, Failure> {
        match self {
            ExecutionResult::Success(success) => Ok(success),
            ExecutionResult::Failure(failure) => Err(failure),
        }
    }

    /// The run report, regardless of outcome.
    pub fn report(&self) -> &RunReport {
        match self {
            ExecutionResult::Success(success) => success.report(),
            ExecutionResult::Failure(failure) => failure.report(),
        }
    }
}

/// The final result of a successful run: the produced values plus the
/// run report.
#[derive(Debug)]
pub struct Success {
    report: RunReport,
    singles: HashMap<ItemId, Arc<dyn Item>>,
    multis: HashMap<ItemId, Vec<Arc<dyn Item>>>,
}

impl Success {
    pub(crate) fn new(
        report: RunReport,
        singles: HashMap<ItemId, Arc<dyn Item>>,
        multis: HashMap<ItemId, Vec<Arc<dyn Item>>>,
    ) -> Self {
        Self {
            report,
            singles,
            multis,
        }
    }

    /// The run report.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// The value produced for the single-valued item `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::MissingValue`] if nothing produced `T`.
    pub fn consume<T: SingleItem>(&self) -> Result<Arc<T>, ContractError> {
        self.consume_at(ItemId::of::<T>())
    }

    /// [`consume`](Success::consume) for an item discriminated by
    /// argument type `A`.
    pub fn consume_for<T: SingleItem, A: Any>(&self) -> Result<Arc<T>, ContractError> {
        self.consume_at(ItemId::of_arg::<T, A>())
    }

    /// The value produced for `T`, if any.
    pub fn consume_optional<T: SingleItem>(&self) -> Option<Arc<T>> {
        self.consume_at(ItemId::of::<T>()).ok()
    }

    /// [`consume_optional`](Success::consume_optional) for an item
    /// discriminated by argument type `A`.
    pub fn consume_optional_for<T: SingleItem, A: Any>(&self) -> Option<Arc<T>> {
        self.consume_at(ItemId::of_arg::<T, A>()).ok()
    }

    /// All values produced for the multi-valued item `T` (possibly
    /// empty), sorted when `T` declares an ordering.
    pub fn consume_multi<T: MultiItem>(&self) -> Vec<Arc<T>> {
        self.consume_multi_at(ItemId::of::<T>())
    }

    /// [`consume_multi`](Success::consume_multi) for an item
    /// discriminated by argument type `A`.
    pub fn consume_multi_for<T: MultiItem, A: Any>(&self) -> Vec<Arc<T>> {
        self.consume_multi_at(ItemId::of_arg::<T, A>())
    }

    /// Close every produced value through [`Item::close`], best-effort.
    ///
    /// Individual close failures are logged and do not interrupt the
    /// sweep.
    pub fn close_all(&self) {
        for value in self.singles.values() {
            close_one(value);
        }
        for list in self.multis.values() {
            for value in list {
                close_one(value);
            }
        }
    }

    fn consume_at<T: SingleItem>(&self, id: ItemId) -> Result<Arc<T>, ContractError> {
        let value = self
            .singles
            .get(&id)
            .cloned()
            .ok_or(ContractError::MissingValue(id))?;
        downcast_item(value, id)
    }

    fn consume_multi_at<T: MultiItem>(&self, id: ItemId) -> Vec<Arc<T>> {
        self.multis
            .get(&id)
            .map(|list| {
                list.iter()
                    .filter_map(|value| downcast_item(Arc::clone(value), id).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn close_one(value: &Arc<dyn Item>) {
    if let Err(error) = value.close() {
        warn!(%error, value = ?value, "failed to close produced value");
    }
}

/// The final result of a failed run: the captured problems plus the run
/// report.
#[derive(Debug)]
pub struct Failure {
    report: RunReport,
    problems: Vec<StepError>,
}

impl Failure {
    pub(crate) fn new(report: RunReport, problems: Vec<StepError>) -> Self {
        Self { report, problems }
    }

    /// The run report.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// The problems captured from failed steps, in capture order.
    pub fn problems(&self) -> &[StepError] {
        &self.problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Output(&'static str);
    crate::single_item!(Output);

    fn report_with(states: &[(&str, StepState)]) -> RunReport {
        let now = SystemTime::now();
        let summaries = states
            .iter()
            .map(|(name, state)| {
                let id = StepId::named(*name);
                (id.clone(), StepSummary::new(id, *state, now, now))
            })
            .collect();
        RunReport::new(now, now, Duration::from_millis(5), summaries)
    }

    #[test]
    fn test_executed_steps_exclude_skipped() {
        let report = report_with(&[
            ("done", StepState::Complete),
            ("broken", StepState::Failed),
            ("skipped", StepState::Skipped),
        ]);
        let mut executed: Vec<String> = report.executed_steps().map(|id| id.to_string()).collect();
        executed.sort();
        assert_eq!(executed, vec!["broken", "done"]);
    }

    #[test]
    fn test_summary_duration_clamps_to_zero() {
        let now = SystemTime::now();
        let earlier = now - Duration::from_secs(1);
        let summary = StepSummary::new(StepId::named("s"), StepState::Complete, now, earlier);
        assert_eq!(summary.duration(), Duration::ZERO);
    }

    #[test]
    fn test_success_lookup() {
        let mut singles: HashMap<ItemId, Arc<dyn Item>> = HashMap::new();
        singles.insert(ItemId::of::<Output>(), Arc::new(Output("ready")));
        let success = Success::new(report_with(&[]), singles, HashMap::new());

        assert_eq!(success.consume::<Output>().expect("present").0, "ready");
        assert!(success.consume_optional::<Output>().is_some());
    }

    #[test]
    fn test_success_missing_value() {
        let success = Success::new(report_with(&[]), HashMap::new(), HashMap::new());
        assert_eq!(
            success.consume::<Output>().unwrap_err(),
            ContractError::MissingValue(ItemId::of::<Output>())
        );
        assert!(success.consume_optional::<Output>().is_none());
    }
}

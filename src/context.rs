use crate::chain::StepInfo;
use crate::error::{BoxError, ContractError, StepError};
use crate::execution::Execution;
use crate::item::{downcast_item, insert_value, Item, ItemId, MultiItem, SingleItem, ValueItem};
use crate::result::StepSummary;
use crate::runner::TaskRunner;
use crate::step::StepId;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{trace, warn};

/// The lifecycle of one step within one execution.
///
/// Steps move `Waiting → Running → {Complete, Failed}`, or
/// `Waiting → Skipped` when an earlier failure short-circuits the rest of
/// the graph. All transitions are compare-and-set; every state here except
/// `Waiting` and `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum StepState {
    /// Not all dependencies have finished yet.
    Waiting = 0,
    /// The step callback is currently executing.
    Running = 1,
    /// The step callback returned successfully.
    Complete = 2,
    /// The step callback returned an error.
    Failed = 3,
    /// The step was bypassed because the run had already failed.
    Skipped = 4,
}

impl StepState {
    fn from_u8(raw: u8) -> StepState {
        match raw {
            0 => StepState::Waiting,
            1 => StepState::Running,
            2 => StepState::Complete,
            3 => StepState::Failed,
            _ => StepState::Skipped,
        }
    }
}

/// The context passed to a step's callback.
///
/// One context exists per step per execution. It is the step's window
/// into the shared item stores: values are published with
/// [`produce`](StepContext::produce) and read with
/// [`consume`](StepContext::consume), and both are only legal while the
/// step is in the [`Running`](StepState::Running) state and only for
/// items the step declared.
pub struct StepContext {
    execution: Arc<Execution>,
    info: Arc<StepInfo>,
    remaining: AtomicUsize,
    state: AtomicU8,
    attachments: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl StepContext {
    pub(crate) fn new(execution: Arc<Execution>, info: Arc<StepInfo>) -> Self {
        let remaining = AtomicUsize::new(info.dependency_count());
        Self {
            execution,
            info,
            remaining,
            state: AtomicU8::new(StepState::Waiting as u8),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    /// The identifier of this step.
    pub fn id(&self) -> &StepId {
        self.info.id()
    }

    /// The current state of this step.
    pub fn state(&self) -> StepState {
        StepState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Produce a value for the single-valued item `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractError`] if the step is not running, did not
    /// declare `T`, or a value for `T` already exists.
    pub fn produce<T: SingleItem>(&self, value: T) -> Result<(), StepError> {
        Ok(self.produce_single(ItemId::of::<T>(), Arc::new(value))?)
    }

    /// [`produce`](StepContext::produce) for an item discriminated by
    /// argument type `A`.
    pub fn produce_for<T: SingleItem, A: Any>(&self, value: T) -> Result<(), StepError> {
        Ok(self.produce_single(ItemId::of_arg::<T, A>(), Arc::new(value))?)
    }

    /// Produce one value for the multi-valued item `T`.
    ///
    /// May be called any number of times; values accumulate, sorted when
    /// `T` declares an ordering.
    pub fn produce_multi<T: MultiItem>(&self, value: T) -> Result<(), StepError> {
        Ok(self.produce_multi_at(ItemId::of::<T>(), Arc::new(value))?)
    }

    /// [`produce_multi`](StepContext::produce_multi) for an item
    /// discriminated by argument type `A`.
    pub fn produce_multi_for<T: MultiItem, A: Any>(&self, value: T) -> Result<(), StepError> {
        Ok(self.produce_multi_at(ItemId::of_arg::<T, A>(), Arc::new(value))?)
    }

    /// Consume the value produced for the single-valued item `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractError`] if the step is not running, did not
    /// declare `T`, or no value is available.
    pub fn consume<T: SingleItem>(&self) -> Result<Arc<T>, StepError> {
        let id = ItemId::of::<T>();
        let value = self
            .consume_single(id)?
            .ok_or(ContractError::MissingValue(id))?;
        Ok(downcast_item(value, id)?)
    }

    /// [`consume`](StepContext::consume) for an item discriminated by
    /// argument type `A`.
    pub fn consume_for<T: SingleItem, A: Any>(&self) -> Result<Arc<T>, StepError> {
        let id = ItemId::of_arg::<T, A>();
        let value = self
            .consume_single(id)?
            .ok_or(ContractError::MissingValue(id))?;
        Ok(downcast_item(value, id)?)
    }

    /// Consume the value for `T` if one was produced.
    pub fn consume_optional<T: SingleItem>(&self) -> Result<Option<Arc<T>>, StepError> {
        let id = ItemId::of::<T>();
        match self.consume_single(id)? {
            Some(value) => Ok(Some(downcast_item(value, id)?)),
            None => Ok(None),
        }
    }

    /// [`consume_optional`](StepContext::consume_optional) for an item
    /// discriminated by argument type `A`.
    pub fn consume_optional_for<T: SingleItem, A: Any>(
        &self,
    ) -> Result<Option<Arc<T>>, StepError> {
        let id = ItemId::of_arg::<T, A>();
        match self.consume_single(id)? {
            Some(value) => Ok(Some(downcast_item(value, id)?)),
            None => Ok(None),
        }
    }

    /// Consume all values produced so far for the multi-valued item `T`.
    ///
    /// The returned list is a snapshot; if `T` declares an ordering it is
    /// sorted, otherwise it is in insertion order.
    pub fn consume_multi<T: MultiItem>(&self) -> Result<Vec<Arc<T>>, StepError> {
        let id = ItemId::of::<T>();
        self.collect_multi(id)
    }

    /// [`consume_multi`](StepContext::consume_multi) for an item
    /// discriminated by argument type `A`.
    pub fn consume_multi_for<T: MultiItem, A: Any>(&self) -> Result<Vec<Arc<T>>, StepError> {
        let id = ItemId::of_arg::<T, A>();
        self.collect_multi(id)
    }

    /// Whether a value for `T` was produced and this step may consume it.
    pub fn is_available_to_consume<T: ValueItem>(&self) -> bool {
        self.available(ItemId::of::<T>())
    }

    /// Whether some included step consumes `T` for its value.
    ///
    /// If an item is not consumed, producers are not required to produce
    /// it and may skip expensive work.
    pub fn is_consumed<T: ValueItem>(&self) -> bool {
        self.execution.chain().is_consumed(&ItemId::of::<T>())
    }

    /// Mark the execution as failed without recording a problem.
    ///
    /// Steps that have not started yet will be skipped; the run finishes
    /// as a [`Failure`](crate::Failure).
    pub fn mark_failed(&self) {
        self.execution.set_error_reported();
    }

    /// Record a problem and mark the execution as failed.
    pub fn add_problem(&self, problem: impl Into<BoxError>) {
        self.execution
            .report_problem(StepError::Failed(problem.into()));
    }

    /// The task runner driving this execution, for ad-hoc parallel work.
    pub fn runner(&self) -> &dyn TaskRunner {
        self.execution.runner()
    }

    /// Attach an opaque value under `key` for the remainder of this
    /// execution; last write per key wins.
    pub fn attach<T: Any + Send + Sync>(&self, key: &'static str, value: T) {
        self.attachments.lock().insert(key, Arc::new(value));
    }

    /// Read back a value stored with [`attach`](StepContext::attach).
    pub fn attachment<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attachments.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Read an attachment placed on the step declaration with
    /// [`StepBuilder::attach`](crate::StepBuilder::attach).
    pub fn step_attachment<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.info.attachment(key)?.downcast::<T>().ok()
    }

    // -- //

    fn check_running(&self) -> Result<(), ContractError> {
        if self.state() == StepState::Running {
            Ok(())
        } else {
            Err(ContractError::NotRunning)
        }
    }

    fn produce_single(&self, id: ItemId, value: Arc<dyn Item>) -> Result<(), ContractError> {
        self.check_running()?;
        if !self.info.produces().contains(&id) {
            return Err(ContractError::UndeclaredItem(id));
        }
        match self.execution.singles().entry(id) {
            Entry::Occupied(_) => Err(ContractError::DuplicateValue(id)),
            Entry::Vacant(slot) => {
                let _ = slot.insert(value);
                Ok(())
            }
        }
    }

    fn produce_multi_at<T: MultiItem>(&self, id: ItemId, value: Arc<T>) -> Result<(), ContractError> {
        self.check_running()?;
        if !self.info.produces().contains(&id) {
            return Err(ContractError::UndeclaredItem(id));
        }
        let mut entry = self.execution.multis().entry(id).or_default();
        insert_value(entry.value_mut(), value);
        Ok(())
    }

    fn consume_single(&self, id: ItemId) -> Result<Option<Arc<dyn Item>>, ContractError> {
        self.check_running()?;
        if !self.info.consumes().contains(&id) {
            return Err(ContractError::UndeclaredItem(id));
        }
        Ok(self
            .execution
            .singles()
            .get(&id)
            .map(|entry| Arc::clone(entry.value())))
    }

    fn collect_multi<T: MultiItem>(&self, id: ItemId) -> Result<Vec<Arc<T>>, StepError> {
        self.check_running().map_err(StepError::from)?;
        if !self.info.consumes().contains(&id) {
            return Err(ContractError::UndeclaredItem(id).into());
        }
        let values: Vec<Arc<dyn Item>> = self
            .execution
            .multis()
            .get(&id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            out.push(downcast_item(value, id)?);
        }
        Ok(out)
    }

    fn available(&self, id: ItemId) -> bool {
        if !self.info.consumes().contains(&id) {
            return false;
        }
        if id.multi() {
            self.execution
                .multis()
                .get(&id)
                .map(|entry| !entry.value().is_empty())
                .unwrap_or(false)
        } else {
            self.execution.singles().contains_key(&id)
        }
    }

    fn transition(&self, from: StepState, to: StepState) {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        assert!(
            swapped,
            "step {} reached an unexpected state (expected {from:?} -> {to:?})",
            self.info.id()
        );
    }

    /// Run the step body: skip if the run already failed, otherwise
    /// invoke the callback and record the outcome; then archive the
    /// summary and notify dependents.
    pub(crate) fn run(&self) {
        let info = &self.info;
        let started_at = SystemTime::now();
        let started = Instant::now();
        let state = if self.execution.is_error_reported() {
            self.transition(StepState::Waiting, StepState::Skipped);
            trace!(step = %info.id(), "skipping step after earlier failure");
            StepState::Skipped
        } else {
            self.transition(StepState::Waiting, StepState::Running);
            trace!(step = %info.id(), "starting step");
            match (info.action().as_ref())(self) {
                Ok(()) => {
                    self.transition(StepState::Running, StepState::Complete);
                    StepState::Complete
                }
                Err(error) => {
                    warn!(step = %info.id(), %error, "step failed");
                    self.execution.report_problem(error);
                    self.transition(StepState::Running, StepState::Failed);
                    StepState::Failed
                }
            }
        };
        trace!(step = %info.id(), ?state, elapsed = ?started.elapsed(), "finished step");
        self.execution.archive_summary(StepSummary::new(
            info.id().clone(),
            state,
            started_at,
            SystemTime::now(),
        ));
        self.execution.evict_context(info.index());
        if info.dependent_indices().is_empty() {
            self.execution.end_step_finished();
        } else {
            for &dependent in info.dependent_indices() {
                Execution::context(&self.execution, dependent).dep_finished();
            }
        }
    }

    /// Called once per finished dependency; submits this step when the
    /// countdown reaches zero.
    pub(crate) fn dep_finished(&self) {
        let remaining = self.remaining.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(step = %self.info.id(), remaining, "dependency finished");
        if remaining == 0 {
            Execution::submit(&self.execution, self.info.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            StepState::Waiting,
            StepState::Running,
            StepState::Complete,
            StepState::Failed,
            StepState::Skipped,
        ] {
            assert_eq!(StepState::from_u8(state as u8), state);
        }
    }
}

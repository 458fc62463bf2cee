use crate::error::{ChainBuildError, StepError};
use crate::execution::ExecutionBuilder;
use crate::item::{ItemId, ValueItem};
use crate::context::StepContext;
use crate::step::{Constraint, ConsumeFlags, ProduceFlags, Step, StepBuilder, StepDecl, StepFn, StepId};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Environment variable naming a file to receive a DOT rendering of every
/// successfully built chain.
pub const GRAPH_OUTPUT_ENV: &str = "KUMIHIMO_GRAPH_OUTPUT";

/// Accumulates step declarations plus the initial and final item sets,
/// and assembles them into a validated, pruned [`Chain`].
///
/// # Examples
///
/// ```
/// use kumihimo::Chain;
///
/// #[derive(Debug)]
/// struct Report(String);
/// kumihimo::single_item!(Report);
///
/// let mut builder = Chain::builder();
/// builder
///     .add_raw_step(|ctx| ctx.produce(Report("done".into())))
///     .produces::<Report>()
///     .build();
/// builder.add_final::<Report>();
/// let chain = builder.build().expect("valid chain");
/// assert_eq!(chain.step_count(), 1);
/// ```
#[derive(Default)]
pub struct ChainBuilder {
    steps: Vec<StepDecl>,
    initial_ids: HashSet<ItemId>,
    final_ids: HashSet<ItemId>,
}

impl ChainBuilder {
    /// Create an empty chain builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step from a raw callback.
    ///
    /// Returns the step's builder; the step becomes part of the chain
    /// only once [`StepBuilder::build`] is called.
    pub fn add_raw_step<F>(&mut self, action: F) -> StepBuilder<'_>
    where
        F: Fn(&StepContext) -> Result<(), StepError> + Send + Sync + 'static,
    {
        StepBuilder::new(self, Arc::new(action))
    }

    /// Add a typed [`Step`] implementation.
    ///
    /// The step's [`declare`](Step::declare) hook supplies its produce and
    /// consume declarations; its [`run`](Step::run) method becomes the
    /// callback.
    pub fn add_step<S: Step>(&mut self, step: S) -> &mut Self {
        let step = Arc::new(step);
        let id = step.id();
        let action = {
            let step = Arc::clone(&step);
            move |ctx: &StepContext| step.run(ctx)
        };
        let declared = step.declare(self.add_raw_step(action).with_id(id));
        declared.build();
        self
    }

    /// Declare an item supplied by the caller before execution.
    ///
    /// No step may declare a real producer for a single-valued initial
    /// item; the value arrives through
    /// [`ExecutionBuilder::provide`](crate::ExecutionBuilder::provide).
    pub fn add_initial<T: ValueItem>(&mut self) -> &mut Self {
        self.initial_ids.insert(ItemId::of::<T>());
        self
    }

    /// [`add_initial`](ChainBuilder::add_initial) for an item discriminated
    /// by argument type `A`.
    pub fn add_initial_for<T: ValueItem, A: Any>(&mut self) -> &mut Self {
        self.initial_ids.insert(ItemId::of_arg::<T, A>());
        self
    }

    /// Declare an output the caller wants retained after execution.
    ///
    /// Final items drive pruning: only steps reachable from a final item
    /// are included in the built chain.
    pub fn add_final<T: ValueItem>(&mut self) -> &mut Self {
        self.final_ids.insert(ItemId::of::<T>());
        self
    }

    /// [`add_final`](ChainBuilder::add_final) for an item discriminated by
    /// argument type `A`.
    pub fn add_final_for<T: ValueItem, A: Any>(&mut self) -> &mut Self {
        self.final_ids.insert(ItemId::of_arg::<T, A>());
        self
    }

    pub(crate) fn commit(&mut self, decl: StepDecl) {
        self.steps.push(decl);
    }

    /// Validate and prune the declared steps into an immutable [`Chain`].
    ///
    /// # Errors
    ///
    /// Returns a [`ChainBuildError`] for duplicate non-overridable real
    /// producers, a real producer of an initial item, a required consumed
    /// item with no producers, or a dependency cycle.
    pub fn build(self) -> Result<Chain, ChainBuildError> {
        let ChainBuilder {
            steps,
            initial_ids,
            final_ids,
        } = self;

        // index every produce, validating real producers as we go
        let mut all_produces: HashMap<ItemId, Vec<ProduceEdge>> = HashMap::new();
        for (idx, decl) in steps.iter().enumerate() {
            for (&item, produce) in &decl.produces {
                let list = all_produces.entry(item).or_default();
                let overridable = produce.flags.contains(ProduceFlags::OVERRIDABLE);
                if !item.multi() && produce.constraint == Constraint::Real {
                    if initial_ids.contains(&item) {
                        return Err(ChainBuildError::ProducesInitial {
                            item,
                            step: decl.id.clone(),
                        });
                    }
                    if list.iter().any(|p| p.real && p.overridable == overridable) {
                        return Err(ChainBuildError::MultipleProducers {
                            item,
                            step: decl.id.clone(),
                        });
                    }
                }
                list.push(ProduceEdge {
                    step: idx,
                    item,
                    real: produce.constraint == Constraint::Real,
                    weak: produce.flags.contains(ProduceFlags::WEAK),
                    overridable,
                });
            }
        }

        // mark and sweep from the requested outputs
        let mut included = vec![false; steps.len()];
        let mut queue: VecDeque<usize> = VecDeque::new();
        // final items have no consumer step, so their edges are discarded
        let mut final_edges = Vec::new();
        for id in &final_ids {
            resolve_producers(*id, &all_produces, &mut included, &mut queue, &mut final_edges);
        }

        // recursively pull in the producers of everything consumed
        let mut dependencies: HashMap<usize, Vec<ProduceEdge>> = HashMap::new();
        while let Some(idx) = queue.pop_front() {
            for (&item, consume) in &steps[idx].consumes {
                if !consume.flags.contains(ConsumeFlags::OPTIONAL)
                    && !item.multi()
                    && !initial_ids.contains(&item)
                    && !all_produces.contains_key(&item)
                {
                    return Err(ChainBuildError::NoProducers { item });
                }
                let edges = dependencies.entry(idx).or_default();
                resolve_producers(item, &all_produces, &mut included, &mut queue, edges);
            }
        }

        // dependents = inverse of dependencies, restricted to included steps
        let mut dependents: HashMap<usize, HashSet<usize>> = HashMap::new();
        for (&dependent, edges) in &dependencies {
            for edge in edges {
                if included[edge.step] {
                    dependents.entry(edge.step).or_default().insert(dependent);
                }
            }
        }

        cycle_check(&steps, &included, &dependencies)?;

        // build immutable step nodes, compacting indices to included steps
        let mut chain_index = vec![usize::MAX; steps.len()];
        let mut order = Vec::new();
        for (old, inc) in included.iter().enumerate() {
            if *inc {
                chain_index[old] = order.len();
                order.push(old);
            }
        }

        let ids: Vec<StepId> = steps.iter().map(|d| d.id.clone()).collect();
        let mut decls: Vec<Option<StepDecl>> = steps.into_iter().map(Some).collect();

        let mut infos: Vec<Arc<StepInfo>> = Vec::with_capacity(order.len());
        let mut start_steps = Vec::new();
        let mut end_step_count = 0;
        let mut consumed: HashSet<ItemId> = HashSet::new();
        let mut index: HashMap<StepId, usize> = HashMap::new();

        for &old in &order {
            let new_index = chain_index[old];
            let Some(decl) = decls[old].take() else {
                continue;
            };

            let mut dep_steps: HashSet<usize> = HashSet::new();
            if let Some(edges) = dependencies.get(&old) {
                for edge in edges {
                    if included[edge.step] {
                        dep_steps.insert(edge.step);
                    }
                }
            }
            let dependency_ids: HashSet<StepId> =
                dep_steps.iter().map(|&s| ids[s].clone()).collect();

            let dependent_old: Vec<usize> = dependents
                .get(&old)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            let dependent_ids: HashSet<StepId> =
                dependent_old.iter().map(|&s| ids[s].clone()).collect();
            let dependent_indices: Vec<usize> =
                dependent_old.iter().map(|&s| chain_index[s]).collect();

            let real_consumes: HashSet<ItemId> = decl
                .consumes
                .iter()
                .filter(|(_, c)| c.constraint == Constraint::Real)
                .map(|(&i, _)| i)
                .collect();
            let real_produces: HashSet<ItemId> = decl
                .produces
                .iter()
                .filter(|(_, p)| p.constraint == Constraint::Real)
                .map(|(&i, _)| i)
                .collect();
            consumed.extend(real_consumes.iter().copied());

            let dependency_count = dep_steps.len();
            if dependency_count == 0 {
                start_steps.push(new_index);
            }
            if dependent_indices.is_empty() {
                end_step_count += 1;
            }
            index.insert(decl.id.clone(), new_index);
            infos.push(Arc::new(StepInfo {
                index: new_index,
                id: decl.id,
                action: decl.action,
                dependency_count,
                dependencies: dependency_ids,
                dependents: dependent_ids,
                dependent_indices,
                consumes: real_consumes,
                produces: real_produces,
                attachments: decl.attachments,
            }));
        }

        let initial_single_count = initial_ids.iter().filter(|i| !i.multi()).count();
        let initial_multi_count = initial_ids.len() - initial_single_count;

        let chain = Chain {
            inner: Arc::new(ChainInner {
                steps: infos,
                start_steps,
                end_step_count,
                initial_ids,
                consumed,
                initial_single_count,
                initial_multi_count,
                index,
            }),
        };

        debug!(
            steps = chain.step_count(),
            start_steps = chain.inner.start_steps.len(),
            end_steps = chain.inner.end_step_count,
            "chain built"
        );

        if let Ok(path) = std::env::var(GRAPH_OUTPUT_ENV) {
            if !path.is_empty() {
                chain.export_graph(&path);
            }
        }

        Ok(chain)
    }
}

/// One produce declaration, flattened for graph construction.
#[derive(Debug, Clone, Copy)]
struct ProduceEdge {
    step: usize,
    item: ItemId,
    real: bool,
    weak: bool,
    overridable: bool,
}

/// Resolve the producers of `item`, recording dependency edges and
/// enqueueing newly included steps.
///
/// Non-overridable producers always satisfy the item (weak ones record an
/// edge without including their step); overridable producers are a
/// fallback used only when no non-overridable producer exists at all.
fn resolve_producers(
    item: ItemId,
    all_produces: &HashMap<ItemId, Vec<ProduceEdge>>,
    included: &mut [bool],
    queue: &mut VecDeque<usize>,
    dependencies: &mut Vec<ProduceEdge>,
) {
    let Some(producers) = all_produces.get(&item) else {
        return;
    };
    let mut satisfied = false;
    for edge in producers {
        if !edge.overridable {
            if !edge.weak && !included[edge.step] {
                included[edge.step] = true;
                queue.push_back(edge.step);
            }
            dependencies.push(*edge);
            satisfied = true;
        }
    }
    if satisfied {
        return;
    }
    for edge in producers {
        if edge.overridable {
            if !edge.weak && !included[edge.step] {
                included[edge.step] = true;
                queue.push_back(edge.step);
            }
            dependencies.push(*edge);
        }
    }
}

struct CycleState<'a> {
    steps: &'a [StepDecl],
    dependencies: &'a HashMap<usize, Vec<ProduceEdge>>,
    visited: HashSet<usize>,
    checked: HashSet<usize>,
    path: Vec<ProduceEdge>,
}

fn cycle_check(
    steps: &[StepDecl],
    included: &[bool],
    dependencies: &HashMap<usize, Vec<ProduceEdge>>,
) -> Result<(), ChainBuildError> {
    let mut state = CycleState {
        steps,
        dependencies,
        visited: HashSet::new(),
        checked: HashSet::new(),
        path: Vec::new(),
    };
    for (idx, inc) in included.iter().enumerate() {
        if *inc {
            visit(&mut state, idx)?;
        }
    }
    Ok(())
}

fn visit(state: &mut CycleState<'_>, idx: usize) -> Result<(), ChainBuildError> {
    if state.checked.contains(&idx) {
        return Ok(());
    }
    if !state.visited.insert(idx) {
        return Err(ChainBuildError::Cycle {
            path: render_cycle(state.steps, &state.path, idx),
        });
    }
    if let Some(edges) = state.dependencies.get(&idx) {
        let edges = edges.clone();
        for edge in edges {
            state.path.push(edge);
            visit(state, edge.step)?;
            state.path.pop();
        }
    }
    state.visited.remove(&idx);
    state.checked.insert(idx);
    Ok(())
}

fn render_cycle(steps: &[StepDecl], path: &[ProduceEdge], offender: usize) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let mut iter = path.iter().rev().peekable();
    while let Some(edge) = iter.next() {
        let _ = write!(
            out,
            "\n\t{} produced {}\n\t\tto ",
            steps[edge.step].id, edge.item
        );
        match iter.peek() {
            Some(next) if next.step == offender => break,
            None => break,
            _ => {}
        }
    }
    let _ = write!(out, "{}", steps[offender].id);
    out
}

/// The immutable, validated, pruned step graph.
///
/// Cheap to clone (a shared handle); built once by
/// [`ChainBuilder::build`] and never mutated. Executions are started
/// through [`Chain::execution_builder`].
#[derive(Debug, Clone)]
pub struct Chain {
    inner: Arc<ChainInner>,
}

#[derive(Debug)]
struct ChainInner {
    steps: Vec<Arc<StepInfo>>,
    start_steps: Vec<usize>,
    end_step_count: usize,
    initial_ids: HashSet<ItemId>,
    consumed: HashSet<ItemId>,
    initial_single_count: usize,
    initial_multi_count: usize,
    index: HashMap<StepId, usize>,
}

impl Chain {
    /// Get a new chain builder.
    pub fn builder() -> ChainBuilder {
        ChainBuilder::new()
    }

    /// Create a new execution builder for this chain.
    pub fn execution_builder(&self) -> ExecutionBuilder {
        ExecutionBuilder::new(self.clone())
    }

    /// The number of steps included in the chain after pruning.
    pub fn step_count(&self) -> usize {
        self.inner.steps.len()
    }

    /// The number of included steps with no included dependents.
    pub fn end_step_count(&self) -> usize {
        self.inner.end_step_count
    }

    /// The included steps, in no particular order.
    pub fn steps(&self) -> impl Iterator<Item = &StepInfo> {
        self.inner.steps.iter().map(|s| s.as_ref())
    }

    /// The included steps with no included dependencies.
    pub fn start_steps(&self) -> impl Iterator<Item = &StepInfo> {
        self.inner
            .start_steps
            .iter()
            .map(|&i| self.inner.steps[i].as_ref())
    }

    /// Look up an included step by identifier.
    pub fn step(&self, id: &StepId) -> Option<&StepInfo> {
        self.inner
            .index
            .get(id)
            .map(|&i| self.inner.steps[i].as_ref())
    }

    /// Whether `id` was declared as an initial item.
    pub fn has_initial(&self, id: &ItemId) -> bool {
        self.inner.initial_ids.contains(id)
    }

    /// Whether some included step consumes `id` for its value.
    ///
    /// Producers may use this to skip work nothing will read.
    pub fn is_consumed(&self, id: &ItemId) -> bool {
        self.inner.consumed.contains(id)
    }

    pub(crate) fn step_at(&self, index: usize) -> &Arc<StepInfo> {
        &self.inner.steps[index]
    }

    pub(crate) fn start_indices(&self) -> &[usize] {
        &self.inner.start_steps
    }

    pub(crate) fn initial_single_count(&self) -> usize {
        self.inner.initial_single_count
    }

    pub(crate) fn initial_multi_count(&self) -> usize {
        self.inner.initial_multi_count
    }

    /// Write a DOT rendering of the dependency graph.
    ///
    /// Each edge points from a dependent step to the step it depends on.
    /// The same output is produced automatically after every successful
    /// build when the [`GRAPH_OUTPUT_ENV`] environment variable names a
    /// file path.
    pub fn write_graph<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "digraph {{")?;
        writeln!(writer, "    node [shape=rectangle];")?;
        writeln!(writer, "    rankdir=LR;")?;
        writeln!(writer)?;
        write!(writer, "    {{ rank = same; ")?;
        for step in self.start_steps() {
            write!(writer, "{}; ", quoted(&step.id))?;
        }
        writeln!(writer, "}};")?;
        write!(writer, "    {{ rank = same; ")?;
        for step in self.steps() {
            if step.dependent_indices.is_empty() && step.dependency_count > 0 {
                write!(writer, "{}; ", quoted(&step.id))?;
            }
        }
        writeln!(writer, "}};")?;
        writeln!(writer)?;
        for step in self.steps() {
            for dependent in &step.dependents {
                writeln!(writer, "    {} -> {}", quoted(dependent), quoted(&step.id))?;
            }
        }
        writeln!(writer, "}}")
    }

    fn export_graph(&self, path: &str) {
        match std::fs::File::create(path) {
            Ok(mut file) => {
                if let Err(error) = self.write_graph(&mut file) {
                    warn!(%error, path, "failed to write debug graph output");
                }
            }
            Err(error) => warn!(%error, path, "failed to create debug graph output"),
        }
    }
}

fn quoted(id: &StepId) -> String {
    format!("\"{}\"", id.to_string().replace('"', "\\\""))
}

/// An immutable graph node: one included step and its resolved edges.
pub struct StepInfo {
    index: usize,
    id: StepId,
    action: StepFn,
    dependency_count: usize,
    dependencies: HashSet<StepId>,
    dependents: HashSet<StepId>,
    dependent_indices: Vec<usize>,
    consumes: HashSet<ItemId>,
    produces: HashSet<ItemId>,
    attachments: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl StepInfo {
    /// The identifier of this step.
    pub fn id(&self) -> &StepId {
        &self.id
    }

    /// The number of included steps this step depends on.
    pub fn dependency_count(&self) -> usize {
        self.dependency_count
    }

    /// The identifiers of the steps this step depends on.
    pub fn dependencies(&self) -> &HashSet<StepId> {
        &self.dependencies
    }

    /// The identifiers of the steps that depend on this step.
    pub fn dependents(&self) -> &HashSet<StepId> {
        &self.dependents
    }

    /// The item ids this step consumes for their value.
    pub fn consumes(&self) -> &HashSet<ItemId> {
        &self.consumes
    }

    /// The item ids this step produces for their value.
    pub fn produces(&self) -> &HashSet<ItemId> {
        &self.produces
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn action(&self) -> &StepFn {
        &self.action
    }

    pub(crate) fn dependent_indices(&self) -> &[usize] {
        &self.dependent_indices
    }

    pub(crate) fn attachment(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attachments.get(key).cloned()
    }
}

impl fmt::Debug for StepInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInfo")
            .field("id", &self.id)
            .field("dependency_count", &self.dependency_count)
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .field("consumes", &self.consumes)
            .field("produces", &self.produces)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::ProduceFlags;

    #[derive(Debug)]
    struct ItemA;
    crate::single_item!(ItemA);

    #[derive(Debug)]
    struct ItemB;
    crate::single_item!(ItemB);

    #[derive(Debug)]
    struct ItemC;
    crate::single_item!(ItemC);

    fn noop(_: &StepContext) -> Result<(), StepError> {
        Ok(())
    }

    #[test]
    fn test_pruning_excludes_unreachable_steps() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("wanted"))
            .produces::<ItemA>()
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("unwanted"))
            .produces::<ItemB>()
            .build();
        builder.add_final::<ItemA>();

        let chain = builder.build().expect("chain builds");
        assert_eq!(chain.step_count(), 1);
        assert!(chain.step(&StepId::named("wanted")).is_some());
        assert!(chain.step(&StepId::named("unwanted")).is_none());
    }

    #[test]
    fn test_dependency_wiring() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("producer"))
            .produces::<ItemA>()
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("consumer"))
            .consumes::<ItemA>()
            .produces::<ItemB>()
            .build();
        builder.add_final::<ItemB>();

        let chain = builder.build().expect("chain builds");
        let producer = chain.step(&StepId::named("producer")).expect("included");
        let consumer = chain.step(&StepId::named("consumer")).expect("included");

        assert_eq!(producer.dependency_count(), 0);
        assert!(producer.dependents().contains(&StepId::named("consumer")));
        assert_eq!(consumer.dependency_count(), 1);
        assert!(consumer.dependencies().contains(&StepId::named("producer")));
        assert_eq!(chain.end_step_count(), 1);
        assert!(chain.is_consumed(&ItemId::of::<ItemA>()));
        assert!(!chain.is_consumed(&ItemId::of::<ItemB>()));
    }

    #[test]
    fn test_duplicate_real_producers_fail() {
        let mut builder = Chain::builder();
        builder.add_raw_step(noop).produces::<ItemA>().build();
        builder.add_raw_step(noop).produces::<ItemA>().build();
        builder.add_final::<ItemA>();

        assert!(matches!(
            builder.build(),
            Err(ChainBuildError::MultipleProducers { .. })
        ));
    }

    #[test]
    fn test_duplicate_overridable_producers_fail() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .produces_with::<ItemA>(ProduceFlags::OVERRIDABLE)
            .build();
        builder
            .add_raw_step(noop)
            .produces_with::<ItemA>(ProduceFlags::OVERRIDABLE)
            .build();
        builder.add_final::<ItemA>();

        assert!(matches!(
            builder.build(),
            Err(ChainBuildError::MultipleProducers { .. })
        ));
    }

    #[test]
    fn test_override_pair_builds_and_prefers_non_overridable() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("default"))
            .produces_with::<ItemA>(ProduceFlags::OVERRIDABLE)
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("override"))
            .produces::<ItemA>()
            .build();
        builder.add_final::<ItemA>();

        let chain = builder.build().expect("chain builds");
        assert!(chain.step(&StepId::named("override")).is_some());
        assert!(chain.step(&StepId::named("default")).is_none());
    }

    #[test]
    fn test_overridable_fallback_used_when_alone() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("default"))
            .produces_with::<ItemA>(ProduceFlags::OVERRIDABLE)
            .build();
        builder.add_final::<ItemA>();

        let chain = builder.build().expect("chain builds");
        assert!(chain.step(&StepId::named("default")).is_some());
    }

    #[test]
    fn test_weak_producer_not_included_on_its_own() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("weak"))
            .produces_with::<ItemA>(ProduceFlags::WEAK)
            .build();
        builder.add_final::<ItemA>();

        let chain = builder.build().expect("chain builds");
        assert_eq!(chain.step_count(), 0);
    }

    #[test]
    fn test_weak_producer_suppresses_overridable_fallback() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("weak"))
            .produces_with::<ItemA>(ProduceFlags::WEAK)
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("default"))
            .produces_with::<ItemA>(ProduceFlags::OVERRIDABLE)
            .build();
        builder.add_final::<ItemA>();

        let chain = builder.build().expect("chain builds");
        assert!(chain.step(&StepId::named("default")).is_none());
        assert!(chain.step(&StepId::named("weak")).is_none());
    }

    #[test]
    fn test_producing_initial_item_fails() {
        let mut builder = Chain::builder();
        builder.add_initial::<ItemA>();
        builder.add_raw_step(noop).produces::<ItemA>().build();
        builder.add_final::<ItemA>();

        assert!(matches!(
            builder.build(),
            Err(ChainBuildError::ProducesInitial { .. })
        ));
    }

    #[test]
    fn test_missing_producer_fails() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .consumes::<ItemB>()
            .produces::<ItemA>()
            .build();
        builder.add_final::<ItemA>();

        assert!(matches!(
            builder.build(),
            Err(ChainBuildError::NoProducers { .. })
        ));
    }

    #[test]
    fn test_cycle_fails() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("a"))
            .consumes::<ItemB>()
            .produces::<ItemA>()
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("b"))
            .consumes::<ItemA>()
            .produces::<ItemB>()
            .build();
        builder.add_final::<ItemA>();

        match builder.build() {
            Err(ChainBuildError::Cycle { path }) => {
                assert!(path.contains("produced"));
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_order_only_edges_count_for_scheduling() {
        #[derive(Debug)]
        struct Gate;
        crate::marker_item!(Gate);

        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("first"))
            .before_consume::<Gate>()
            .produces::<ItemA>()
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("second"))
            .after_produce::<Gate>()
            .produces::<ItemB>()
            .build();
        builder.add_final::<ItemA>();
        builder.add_final::<ItemB>();

        let chain = builder.build().expect("chain builds");
        let second = chain.step(&StepId::named("second")).expect("included");
        assert_eq!(second.dependency_count(), 1);
        assert!(second.dependencies().contains(&StepId::named("first")));
        // the order-only edge carries no value
        assert!(!second.consumes().contains(&ItemId::of::<Gate>()));
    }

    #[test]
    fn test_after_produce_without_producer_is_fine() {
        #[derive(Debug)]
        struct Gate;
        crate::marker_item!(Gate);

        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .after_produce::<Gate>()
            .produces::<ItemA>()
            .build();
        builder.add_final::<ItemA>();

        let chain = builder.build().expect("chain builds");
        assert_eq!(chain.step_count(), 1);
    }

    #[test]
    fn test_graph_export() {
        let mut builder = Chain::builder();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("producer"))
            .produces::<ItemA>()
            .build();
        builder
            .add_raw_step(noop)
            .with_id(StepId::named("consumer"))
            .consumes::<ItemA>()
            .produces::<ItemB>()
            .build();
        builder.add_final::<ItemB>();

        let chain = builder.build().expect("chain builds");
        let mut out = Vec::new();
        chain.write_graph(&mut out).expect("write succeeds");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("digraph {"));
        assert!(text.contains("\"consumer\" -> \"producer\""));
    }
}

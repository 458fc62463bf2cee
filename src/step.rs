use crate::chain::ChainBuilder;
use crate::context::StepContext;
use crate::error::StepError;
use crate::item::{short_name, Item, ItemId, ValueItem};
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The callback invoked when a step runs.
pub type StepFn = Arc<dyn Fn(&StepContext) -> Result<(), StepError> + Send + Sync + 'static>;

static ANONYMOUS_SEQ: AtomicU64 = AtomicU64::new(1);

/// An identifier for a step.
///
/// Identifiers are used for reporting ([`StepSummary`](crate::StepSummary)
/// lookup, graph export, log messages); the engine itself schedules by
/// graph position, not identity. Each identifier may be chained to an
/// optional parent for composite naming; equality and hashing include the
/// parent chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StepId {
    kind: StepIdKind,
    parent: Option<Box<StepId>>,
}

/// The variants of [`StepId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum StepIdKind {
    /// Automatically generated; carries a globally unique sequence number.
    Anonymous(u64),
    /// A caller-chosen text name.
    Named(String),
    /// Bound to the identity (address) of a particular value.
    Instance {
        /// Type of the bound value
        type_name: &'static str,
        /// Address of the bound value
        address: usize,
    },
    /// Bound to a function or method of a type.
    Function {
        /// The owning type
        owner: &'static str,
        /// The function name
        name: &'static str,
    },
}

impl StepId {
    /// A fresh anonymous identifier with a globally unique sequence number.
    pub fn anonymous() -> Self {
        Self {
            kind: StepIdKind::Anonymous(ANONYMOUS_SEQ.fetch_add(1, Ordering::Relaxed)),
            parent: None,
        }
    }

    /// A string-named identifier.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            kind: StepIdKind::Named(name.into()),
            parent: None,
        }
    }

    /// An identifier bound to the identity of `value`.
    pub fn instance<T>(value: &T) -> Self {
        Self {
            kind: StepIdKind::Instance {
                type_name: std::any::type_name::<T>(),
                address: value as *const T as usize,
            },
            parent: None,
        }
    }

    /// An identifier bound to a function of an owning type.
    pub fn function(owner: &'static str, name: &'static str) -> Self {
        Self {
            kind: StepIdKind::Function { owner, name },
            parent: None,
        }
    }

    /// Chain this identifier to a parent, returning the composite id.
    pub fn with_parent(mut self, parent: StepId) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// The parent identifier, if any.
    pub fn parent(&self) -> Option<&StepId> {
        self.parent.as_deref()
    }

    /// The variant data of this identifier.
    pub fn kind(&self) -> &StepIdKind {
        &self.kind
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}<-")?;
        }
        match &self.kind {
            StepIdKind::Anonymous(n) => write!(f, "anonymous<{n:x}>"),
            StepIdKind::Named(name) => write!(f, "{name}"),
            StepIdKind::Instance { type_name, address } => {
                write!(f, "{}@{address:x}", short_name(type_name))
            }
            StepIdKind::Function { owner, name } => {
                write!(f, "{}::{name}", short_name(owner))
            }
        }
    }
}

/// Whether a produce/consume declaration carries a value or only enforces
/// execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// The edge carries an actual value.
    Real,
    /// The edge only constrains relative execution order.
    OrderOnly,
}

/// Flags applicable to produce declarations, as a small bitset.
///
/// Combine flags with `|`:
///
/// ```
/// use kumihimo::ProduceFlags;
///
/// let flags = ProduceFlags::WEAK | ProduceFlags::OVERRIDABLE;
/// assert!(flags.contains(ProduceFlags::WEAK));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProduceFlags(u8);

impl ProduceFlags {
    /// The empty flag set.
    pub const NONE: Self = Self(0);

    /// Produce the item weakly: the producing step is not included in
    /// the chain merely because something consumes this item.
    pub const WEAK: Self = Self(1);

    /// Produce the item only if no other step produces it.
    pub const OVERRIDABLE: Self = Self(2);

    /// This set plus all flags in `other`.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// This set minus all flags in `other`.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether every flag in `other` is in this set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProduceFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Flags applicable to consume declarations, as a small bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeFlags(u8);

impl ConsumeFlags {
    /// The empty flag set.
    pub const NONE: Self = Self(0);

    /// Do not fail the build even if no step produces the consumed item.
    pub const OPTIONAL: Self = Self(1);

    /// This set plus all flags in `other`.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// This set minus all flags in `other`.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether every flag in `other` is in this set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConsumeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// A single produce declaration, as accumulated on a step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProduceDecl {
    pub constraint: Constraint,
    pub flags: ProduceFlags,
}

impl ProduceDecl {
    /// Combine a repeated declaration of the same `(step, item)` edge.
    ///
    /// The constraint unions toward [`Constraint::Real`]; `Weak` and
    /// `Overridable` survive only if present on both sides.
    pub fn combine(self, constraint: Constraint, flags: ProduceFlags) -> Self {
        let out_constraint = if constraint == Constraint::Real || self.constraint == Constraint::Real
        {
            Constraint::Real
        } else {
            Constraint::OrderOnly
        };
        let mut out_flags = flags.with(self.flags);
        if !flags.contains(ProduceFlags::WEAK) || !self.flags.contains(ProduceFlags::WEAK) {
            out_flags = out_flags.without(ProduceFlags::WEAK);
        }
        if !flags.contains(ProduceFlags::OVERRIDABLE)
            || !self.flags.contains(ProduceFlags::OVERRIDABLE)
        {
            out_flags = out_flags.without(ProduceFlags::OVERRIDABLE);
        }
        Self {
            constraint: out_constraint,
            flags: out_flags,
        }
    }
}

/// A single consume declaration, as accumulated on a step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsumeDecl {
    pub constraint: Constraint,
    pub flags: ConsumeFlags,
}

impl ConsumeDecl {
    /// Combine a repeated declaration of the same `(step, item)` edge.
    ///
    /// The constraint unions toward [`Constraint::Real`]; `Optional`
    /// survives only if present on both sides.
    pub fn combine(self, constraint: Constraint, flags: ConsumeFlags) -> Self {
        let out_constraint = if constraint == Constraint::Real || self.constraint == Constraint::Real
        {
            Constraint::Real
        } else {
            Constraint::OrderOnly
        };
        let out_flags = if !flags.contains(ConsumeFlags::OPTIONAL)
            || !self.flags.contains(ConsumeFlags::OPTIONAL)
        {
            flags.with(self.flags).without(ConsumeFlags::OPTIONAL)
        } else {
            flags.with(self.flags)
        };
        Self {
            constraint: out_constraint,
            flags: out_flags,
        }
    }
}

/// A committed step declaration, owned by the chain builder.
pub(crate) struct StepDecl {
    pub id: StepId,
    pub action: StepFn,
    pub consumes: HashMap<ItemId, ConsumeDecl>,
    pub produces: HashMap<ItemId, ProduceDecl>,
    pub attachments: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

/// A pending step: a callback plus its declared produces and consumes.
///
/// Obtained from [`ChainBuilder::add_raw_step`]; nothing is recorded in
/// the chain until [`build`](StepBuilder::build) is called.
///
/// # Examples
///
/// ```
/// use kumihimo::Chain;
///
/// #[derive(Debug)]
/// struct Greeting(String);
/// kumihimo::single_item!(Greeting);
///
/// let mut builder = Chain::builder();
/// builder
///     .add_raw_step(|ctx| ctx.produce(Greeting("hello".into())))
///     .produces::<Greeting>()
///     .build();
/// ```
pub struct StepBuilder<'a> {
    chain: &'a mut ChainBuilder,
    decl: StepDecl,
}

impl<'a> StepBuilder<'a> {
    pub(crate) fn new(chain: &'a mut ChainBuilder, action: StepFn) -> Self {
        Self {
            chain,
            decl: StepDecl {
                id: StepId::anonymous(),
                action,
                consumes: HashMap::new(),
                produces: HashMap::new(),
                attachments: HashMap::new(),
            },
        }
    }

    /// Replace the step's identifier (anonymous by default).
    pub fn with_id(mut self, id: StepId) -> Self {
        self.decl.id = id;
        self
    }

    /// Attach an opaque value under `key`; last write per key wins.
    ///
    /// Attachments travel with the step into the built chain and can be
    /// read back during execution through
    /// [`StepContext::step_attachment`](crate::StepContext::step_attachment).
    pub fn attach<T: Any + Send + Sync>(mut self, key: &'static str, value: T) -> Self {
        self.decl.attachments.insert(key, Arc::new(value));
        self
    }

    fn add_produce(mut self, id: ItemId, constraint: Constraint, flags: ProduceFlags) -> Self {
        self.decl
            .produces
            .entry(id)
            .and_modify(|d| *d = d.combine(constraint, flags))
            .or_insert(ProduceDecl { constraint, flags });
        self
    }

    fn add_consume(mut self, id: ItemId, constraint: Constraint, flags: ConsumeFlags) -> Self {
        self.decl
            .consumes
            .entry(id)
            .and_modify(|d| *d = d.combine(constraint, flags))
            .or_insert(ConsumeDecl { constraint, flags });
        self
    }

    /// Declare that this step produces a value for item `T`.
    pub fn produces<T: ValueItem>(self) -> Self {
        self.produces_with::<T>(ProduceFlags::NONE)
    }

    /// Declare that this step produces a value for item `T`, with flags.
    pub fn produces_with<T: ValueItem>(self, flags: ProduceFlags) -> Self {
        self.add_produce(ItemId::of::<T>(), Constraint::Real, flags)
    }

    /// Declare that this step produces a value for item `T` discriminated
    /// by argument type `A`.
    pub fn produces_for<T: ValueItem, A: Any>(self) -> Self {
        self.produces_for_with::<T, A>(ProduceFlags::NONE)
    }

    /// Declare that this step produces a value for item `T` discriminated
    /// by argument type `A`, with flags.
    pub fn produces_for_with<T: ValueItem, A: Any>(self, flags: ProduceFlags) -> Self {
        self.add_produce(ItemId::of_arg::<T, A>(), Constraint::Real, flags)
    }

    /// Declare that this step consumes the value produced for item `T`.
    ///
    /// Unless the consume is optional, the item must be produced (or be
    /// initial) somewhere in the chain or the build fails.
    pub fn consumes<T: ValueItem>(self) -> Self {
        self.consumes_with::<T>(ConsumeFlags::NONE)
    }

    /// Declare that this step consumes item `T`, with flags.
    pub fn consumes_with<T: ValueItem>(self, flags: ConsumeFlags) -> Self {
        self.add_consume(ItemId::of::<T>(), Constraint::Real, flags)
    }

    /// Declare that this step consumes item `T` discriminated by argument
    /// type `A`.
    pub fn consumes_for<T: ValueItem, A: Any>(self) -> Self {
        self.consumes_for_with::<T, A>(ConsumeFlags::NONE)
    }

    /// Declare that this step consumes item `T` discriminated by argument
    /// type `A`, with flags.
    pub fn consumes_for_with<T: ValueItem, A: Any>(self, flags: ConsumeFlags) -> Self {
        self.add_consume(ItemId::of_arg::<T, A>(), Constraint::Real, flags)
    }

    /// This step completes before any step which consumes item `T` starts.
    ///
    /// An order-only edge: it constrains scheduling without carrying a
    /// value. If no consumer exists, no constraint is enacted.
    pub fn before_consume<T: Item>(self) -> Self {
        self.before_consume_with::<T>(ProduceFlags::NONE)
    }

    /// Order-only variant of [`produces_with`](StepBuilder::produces_with).
    pub fn before_consume_with<T: Item>(self, flags: ProduceFlags) -> Self {
        self.add_produce(ItemId::of::<T>(), Constraint::OrderOnly, flags)
    }

    /// [`before_consume`](StepBuilder::before_consume) for an item
    /// discriminated by argument type `A`.
    pub fn before_consume_for<T: Item, A: Any>(self) -> Self {
        self.add_produce(
            ItemId::of_arg::<T, A>(),
            Constraint::OrderOnly,
            ProduceFlags::NONE,
        )
    }

    /// This step starts only after any step which produces item `T` has
    /// completed.
    ///
    /// An order-only edge: it constrains scheduling without carrying a
    /// value. If no producer exists, no constraint is enacted.
    pub fn after_produce<T: Item>(self) -> Self {
        self.add_consume(
            ItemId::of::<T>(),
            Constraint::OrderOnly,
            ConsumeFlags::OPTIONAL,
        )
    }

    /// [`after_produce`](StepBuilder::after_produce) for an item
    /// discriminated by argument type `A`.
    pub fn after_produce_for<T: Item, A: Any>(self) -> Self {
        self.add_consume(
            ItemId::of_arg::<T, A>(),
            Constraint::OrderOnly,
            ConsumeFlags::OPTIONAL,
        )
    }

    /// Commit this step into the chain builder.
    pub fn build(self) -> &'a mut ChainBuilder {
        let StepBuilder { chain, decl } = self;
        chain.commit(decl);
        chain
    }
}

/// A reusable step implementation with declared inputs and outputs.
///
/// This is the explicit-registration counterpart to
/// [`ChainBuilder::add_raw_step`]: a type bundles its identity,
/// declarations and behavior, and
/// [`ChainBuilder::add_step`](crate::ChainBuilder::add_step) wires it
/// through the raw path.
///
/// # Examples
///
/// ```
/// use kumihimo::{Chain, Step, StepBuilder, StepContext, StepError};
///
/// #[derive(Debug)]
/// struct Port(u16);
/// kumihimo::single_item!(Port);
///
/// struct BindPort;
///
/// impl Step for BindPort {
///     fn declare<'a>(&self, step: StepBuilder<'a>) -> StepBuilder<'a> {
///         step.produces::<Port>()
///     }
///
///     fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
///         ctx.produce(Port(8080))
///     }
/// }
///
/// let mut builder = Chain::builder();
/// builder.add_step(BindPort).add_final::<Port>();
/// ```
pub trait Step: Send + Sync + 'static {
    /// The identity reported for this step; defaults to the implementing
    /// type's `run` function.
    fn id(&self) -> StepId {
        StepId::function(std::any::type_name::<Self>(), "run")
    }

    /// Declare the items this step produces and consumes.
    fn declare<'a>(&self, step: StepBuilder<'a>) -> StepBuilder<'a>;

    /// Execute the step.
    fn run(&self, ctx: &StepContext) -> Result<(), StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_id_display() {
        assert_eq!(StepId::named("load").to_string(), "load");
        assert_eq!(
            StepId::named("load")
                .with_parent(StepId::named("outer"))
                .to_string(),
            "outer<-load"
        );
        assert_eq!(
            StepId::function("crate::steps::Loader", "run").to_string(),
            "Loader::run"
        );
    }

    #[test]
    fn test_step_id_equality_includes_parent() {
        let plain = StepId::named("x");
        let nested = StepId::named("x").with_parent(StepId::named("p"));
        assert_ne!(plain, nested);
        assert_eq!(
            StepId::named("x").with_parent(StepId::named("p")),
            StepId::named("x").with_parent(StepId::named("p"))
        );
    }

    #[test]
    fn test_anonymous_ids_are_unique() {
        assert_ne!(StepId::anonymous(), StepId::anonymous());
    }

    #[test]
    fn test_produce_flag_sets() {
        let flags = ProduceFlags::WEAK | ProduceFlags::OVERRIDABLE;
        assert!(flags.contains(ProduceFlags::WEAK));
        assert!(flags.contains(ProduceFlags::OVERRIDABLE));
        assert!(!flags
            .without(ProduceFlags::WEAK)
            .contains(ProduceFlags::WEAK));
        assert!(!ProduceFlags::NONE.contains(ProduceFlags::WEAK));
    }

    #[test]
    fn test_produce_combine_upgrades_constraint() {
        let decl = ProduceDecl {
            constraint: Constraint::OrderOnly,
            flags: ProduceFlags::NONE,
        };
        let combined = decl.combine(Constraint::Real, ProduceFlags::NONE);
        assert_eq!(combined.constraint, Constraint::Real);
    }

    #[test]
    fn test_produce_combine_keeps_flags_only_when_on_both_sides() {
        let decl = ProduceDecl {
            constraint: Constraint::Real,
            flags: ProduceFlags::WEAK,
        };

        let still_weak = decl.combine(Constraint::Real, ProduceFlags::WEAK);
        assert!(still_weak.flags.contains(ProduceFlags::WEAK));

        let dropped = decl.combine(Constraint::Real, ProduceFlags::NONE);
        assert!(!dropped.flags.contains(ProduceFlags::WEAK));
    }

    #[test]
    fn test_produce_combine_three_fold() {
        // weak + weak + plain must end up non-weak regardless of grouping
        let decl = ProduceDecl {
            constraint: Constraint::Real,
            flags: ProduceFlags::WEAK,
        };
        let combined = decl
            .combine(Constraint::Real, ProduceFlags::WEAK)
            .combine(Constraint::Real, ProduceFlags::NONE);
        assert!(!combined.flags.contains(ProduceFlags::WEAK));

        // plain first: once dropped, weak never comes back
        let decl = ProduceDecl {
            constraint: Constraint::Real,
            flags: ProduceFlags::WEAK,
        };
        let combined = decl
            .combine(Constraint::Real, ProduceFlags::NONE)
            .combine(Constraint::Real, ProduceFlags::WEAK);
        assert!(!combined.flags.contains(ProduceFlags::WEAK));
    }

    #[test]
    fn test_consume_combine_three_fold() {
        let decl = ConsumeDecl {
            constraint: Constraint::OrderOnly,
            flags: ConsumeFlags::OPTIONAL,
        };
        let combined = decl
            .combine(Constraint::OrderOnly, ConsumeFlags::OPTIONAL)
            .combine(Constraint::Real, ConsumeFlags::NONE);
        assert!(!combined.flags.contains(ConsumeFlags::OPTIONAL));
        assert_eq!(combined.constraint, Constraint::Real);

        let decl = ConsumeDecl {
            constraint: Constraint::OrderOnly,
            flags: ConsumeFlags::OPTIONAL,
        };
        let combined = decl
            .combine(Constraint::OrderOnly, ConsumeFlags::OPTIONAL)
            .combine(Constraint::OrderOnly, ConsumeFlags::OPTIONAL);
        assert!(combined.flags.contains(ConsumeFlags::OPTIONAL));
        assert_eq!(combined.constraint, Constraint::OrderOnly);
    }
}

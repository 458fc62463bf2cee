use crate::error::{BoxError, ContractError};
use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A typed unit of data exchanged between steps.
///
/// Item types are ordinary user structs. Implement this trait (usually
/// through the [`single_item!`](crate::single_item),
/// [`multi_item!`](crate::multi_item) or
/// [`marker_item!`](crate::marker_item) macros) to make a type usable in
/// produce/consume declarations.
///
/// A type that implements only `Item`, and neither [`SingleItem`] nor
/// [`MultiItem`], is a *marker item*: it can appear in order-only
/// declarations ([`StepBuilder::before_consume`](crate::StepBuilder::before_consume),
/// [`StepBuilder::after_produce`](crate::StepBuilder::after_produce)) but
/// can never carry a value.
pub trait Item: Any + Send + Sync + fmt::Debug {
    /// Whether values of this type accumulate into a collection rather
    /// than overwrite. This is a static property of the type, not of any
    /// particular value.
    fn multi() -> bool
    where
        Self: Sized,
    {
        false
    }

    /// Release any resources held by this value.
    ///
    /// Called by [`Success::close_all`](crate::Success::close_all) for
    /// every produced value; the default implementation does nothing.
    fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// An item that carries a value, whether single-valued or multi-valued.
///
/// This is the bound required by value-carrying declarations
/// (`produces`/`consumes`); marker items do not implement it.
pub trait ValueItem: Item {}

/// A single-valued item: at most one value may exist per [`ItemId`].
///
/// Producing a second value for the same id during a run is a
/// [`ContractError::DuplicateValue`].
pub trait SingleItem: ValueItem {}

/// A multi-valued item: values accumulate into a list.
///
/// Set [`ORDERED`](MultiItem::ORDERED) to `true` and implement
/// [`compare`](MultiItem::compare) to keep the list sorted as values are
/// inserted (the `multi_item!(Ty, ordered)` macro form does this from the
/// type's [`Ord`] implementation). Unordered multi items accumulate in
/// insertion order.
pub trait MultiItem: ValueItem {
    /// Whether accumulated values are kept sorted by
    /// [`compare`](MultiItem::compare).
    const ORDERED: bool = false;

    /// Ordering used for sorted insertion when
    /// [`ORDERED`](MultiItem::ORDERED) is `true`.
    fn compare(&self, _other: &Self) -> Ordering {
        Ordering::Equal
    }
}

/// The identity of a data item: a type plus an optional class argument.
///
/// The class argument distinguishes multiple item identities sharing the
/// same underlying type (for example, "configuration for `A`" versus
/// "configuration for `B`"). An id without an argument is never equal to
/// one with an argument.
///
/// # Examples
///
/// ```
/// use kumihimo::ItemId;
///
/// #[derive(Debug)]
/// struct Config(String);
/// kumihimo::single_item!(Config);
///
/// struct ForA;
/// struct ForB;
///
/// assert_eq!(ItemId::of::<Config>(), ItemId::of::<Config>());
/// assert_ne!(ItemId::of::<Config>(), ItemId::of_arg::<Config, ForA>());
/// assert_ne!(
///     ItemId::of_arg::<Config, ForA>(),
///     ItemId::of_arg::<Config, ForB>(),
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId {
    type_id: TypeId,
    type_name: &'static str,
    multi: bool,
    arg: Option<TypeTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl ItemId {
    /// The id of item type `T` with no class argument.
    pub fn of<T: Item>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            multi: T::multi(),
            arg: None,
        }
    }

    /// The id of item type `T` discriminated by the argument type `A`.
    pub fn of_arg<T: Item, A: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            multi: T::multi(),
            arg: Some(TypeTag {
                id: TypeId::of::<A>(),
                name: std::any::type_name::<A>(),
            }),
        }
    }

    /// Whether many values of this id may coexist.
    pub fn multi(&self) -> bool {
        self.multi
    }
}

pub(crate) fn short_name(name: &str) -> &str {
    name.split("::").last().unwrap_or(name)
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.arg {
            Some(arg) => write!(
                f,
                "{}<{}>",
                short_name(self.type_name),
                short_name(arg.name)
            ),
            None => write!(f, "{}", short_name(self.type_name)),
        }
    }
}

/// Downcast a stored value back to its concrete item type.
pub(crate) fn downcast_item<T: Item>(
    value: Arc<dyn Item>,
    id: ItemId,
) -> Result<Arc<T>, ContractError> {
    let any: Arc<dyn Any + Send + Sync> = value;
    any.downcast::<T>()
        .map_err(|_| ContractError::TypeMismatch(id))
}

/// Append a multi-item value, keeping the list sorted when the item type
/// declares an ordering.
pub(crate) fn insert_value<T: MultiItem>(list: &mut Vec<Arc<dyn Item>>, value: Arc<T>) {
    if T::ORDERED {
        let pos = list.partition_point(|existing| {
            let any: &dyn Any = existing.as_ref();
            any.downcast_ref::<T>()
                .is_some_and(|e| e.compare(value.as_ref()) == Ordering::Less)
        });
        list.insert(pos, value);
    } else {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Solo(&'static str);
    crate::single_item!(Solo);

    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Ranked(u32);
    crate::multi_item!(Ranked, ordered);

    #[derive(Debug)]
    struct Logged(&'static str);
    crate::multi_item!(Logged);

    struct ArgA;
    struct ArgB;

    #[test]
    fn test_item_id_equality() {
        assert_eq!(ItemId::of::<Solo>(), ItemId::of::<Solo>());
        assert_ne!(ItemId::of::<Solo>(), ItemId::of::<Ranked>());
        // an id with no argument never equals one with an argument
        assert_ne!(ItemId::of::<Solo>(), ItemId::of_arg::<Solo, ArgA>());
        assert_ne!(
            ItemId::of_arg::<Solo, ArgA>(),
            ItemId::of_arg::<Solo, ArgB>()
        );
    }

    #[test]
    fn test_multi_is_a_type_property() {
        assert!(!ItemId::of::<Solo>().multi());
        assert!(ItemId::of::<Ranked>().multi());
        assert!(ItemId::of_arg::<Ranked, ArgA>().multi());
    }

    #[test]
    fn test_display_uses_short_names() {
        assert_eq!(ItemId::of::<Solo>().to_string(), "Solo");
        assert_eq!(ItemId::of_arg::<Solo, ArgA>().to_string(), "Solo<ArgA>");
    }

    #[test]
    fn test_sorted_insertion() {
        let mut list: Vec<Arc<dyn Item>> = Vec::new();
        insert_value(&mut list, Arc::new(Ranked(30)));
        insert_value(&mut list, Arc::new(Ranked(10)));
        insert_value(&mut list, Arc::new(Ranked(20)));

        let ranks: Vec<u32> = list
            .iter()
            .map(|v| {
                let any: &dyn Any = v.as_ref();
                any.downcast_ref::<Ranked>().map(|r| r.0).unwrap_or(0)
            })
            .collect();
        assert_eq!(ranks, vec![10, 20, 30]);
    }

    #[test]
    fn test_unordered_insertion_keeps_arrival_order() {
        let mut list: Vec<Arc<dyn Item>> = Vec::new();
        insert_value(&mut list, Arc::new(Logged("b")));
        insert_value(&mut list, Arc::new(Logged("a")));

        let names: Vec<&str> = list
            .iter()
            .map(|v| {
                let any: &dyn Any = v.as_ref();
                any.downcast_ref::<Logged>().map(|l| l.0).unwrap_or("")
            })
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_downcast_round_trip() {
        let value: Arc<dyn Item> = Arc::new(Solo("x"));
        let id = ItemId::of::<Solo>();
        let back = downcast_item::<Solo>(value, id);
        assert!(back.is_ok());

        let value: Arc<dyn Item> = Arc::new(Solo("x"));
        let wrong = downcast_item::<Ranked>(value, id);
        assert_eq!(wrong.unwrap_err(), ContractError::TypeMismatch(id));
    }
}

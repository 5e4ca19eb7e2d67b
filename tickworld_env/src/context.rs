//! Owning-context capability for schedulable objects.

use std::fmt::Debug;
use std::hash::Hash;

/// A tagged kind of owning context.
///
/// Kinds form an explicit override chain: each kind names the kind it
/// specializes (its base), ending at a kind with no base. Scheduler
/// definitions resolve templates by walking this chain from the most
/// specific kind to the least specific.
///
/// # Example
///
/// ```
/// use tickworld_env::ContextKind;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// enum Kind { Computer, Server }
///
/// impl ContextKind for Kind {
///     fn base(&self) -> Option<Self> {
///         match self {
///             Kind::Computer => None,
///             Kind::Server => Some(Kind::Computer),
///         }
///     }
/// }
///
/// assert_eq!(Kind::Server.lineage(), vec![Kind::Server, Kind::Computer]);
/// ```
pub trait ContextKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// The kind this one specializes, if any.
    fn base(&self) -> Option<Self>;

    /// This kind followed by every base kind, most specific first.
    ///
    /// Stops early if the chain loops back on itself.
    fn lineage(&self) -> Vec<Self> {
        let mut chain = vec![*self];
        let mut current = self.base();
        while let Some(kind) = current {
            if chain.contains(&kind) {
                break;
            }
            chain.push(kind);
            current = kind.base();
        }
        chain
    }

    /// True if `self` is `other` or specializes it.
    fn is_a(&self, other: Self) -> bool {
        self.lineage().contains(&other)
    }
}

/// An object that can host a scheduler and be handed to its tasks.
///
/// The scheduler asks nothing of its owner beyond identity and kind;
/// everything else is up to the task actions.
pub trait Schedulable: Send + Sync + 'static {
    type Kind: ContextKind;

    /// Runtime kind of this instance.
    fn kind(&self) -> Self::Kind;

    /// Human readable label for logs.
    fn label(&self) -> String {
        format!("{:?}", self.kind())
    }
}

//! Formula algebra over primary-key bitmaps.
//!
//! A query is compiled into a [`FormulaTree`]: an arena of immutable nodes,
//! each describing one set operation or index lookup. Nodes expose a
//! structural hash, an estimated cardinality and an estimated cost before
//! anything is evaluated; [`FormulaTree::compute`] evaluates lazily and
//! memoizes per node.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut tree = FormulaTree::new();
//! let red = tree.attribute_equals(&color_index, "red");
//! let cheap = tree.attribute_range(&price_index, Bound::Unbounded, Bound::Excluded(100_i64.into()));
//! let root = tree.and(vec![red, cheap])?;
//! let keys = tree.compute(root, &EvaluationContext::cached(&engine, scope))?;
//! ```

mod compute;
mod estimate;
mod hash;
mod optimizer;
mod translate;

#[cfg(test)]
mod translate_tests;

pub use compute::EvaluationContext;
pub use optimizer::{FormulaOptimizer, OptimizedFormula, RewriteScope};

use std::cell::OnceCell;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::index::{
    AttributeIndex, AttributeSnapshot, AttributeValue, ReferenceIndex, ReferenceSnapshot,
    TranslationDirection,
};

/// Handle of a node inside a [`FormulaTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormulaId(u32);

impl FormulaId {
    /// Position of the node in its arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Number of children a formula kind accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many children.
    Exactly(usize),
    /// This many children or more.
    AtLeast(usize),
}

impl Arity {
    /// Returns true if `count` children are acceptable.
    #[must_use]
    pub const fn accepts(self, count: usize) -> bool {
        match self {
            Self::Exactly(n) => count == n,
            Self::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exactly(n) => write!(f, "exactly {n}"),
            Self::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// Supplier of a planner-provided lazy result.
pub type Supplier = Arc<dyn Fn() -> Bitmap + Send + Sync>;

/// A formula whose result is produced by a planner-supplied closure.
///
/// The planner is responsible for the hash identifying the supplied set and
/// for estimates that are upper bounds of the real cardinality.
#[derive(Clone)]
pub struct DeferredFormula {
    label: String,
    hash: u64,
    estimated_cardinality: Option<u64>,
    estimated_cost: Option<u64>,
    cacheable: bool,
    supplier: Supplier,
}

impl DeferredFormula {
    /// Creates a non-cacheable deferred formula without estimates.
    pub fn new<F>(label: impl Into<String>, hash: u64, supplier: F) -> Self
    where
        F: Fn() -> Bitmap + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            hash,
            estimated_cardinality: None,
            estimated_cost: None,
            cacheable: false,
            supplier: Arc::new(supplier),
        }
    }

    /// Sets the estimated cardinality (an upper bound) and cost.
    #[must_use]
    pub fn with_estimates(mut self, cardinality: u64, cost: u64) -> Self {
        self.estimated_cardinality = Some(cardinality);
        self.estimated_cost = Some(cost);
        self
    }

    /// Marks the result as eligible for the result cache.
    #[must_use]
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Label used in diagnostics.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn supply(&self) -> Bitmap {
        (self.supplier)()
    }
}

impl fmt::Debug for DeferredFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredFormula")
            .field("label", &self.label)
            .field("hash", &self.hash)
            .field("estimated_cardinality", &self.estimated_cardinality)
            .field("estimated_cost", &self.estimated_cost)
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

/// The closed set of formula kinds.
#[derive(Debug, Clone)]
pub enum FormulaKind {
    /// The empty set.
    Empty,
    /// A literal set of keys.
    Constant(Bitmap),
    /// The universe of the queried collection.
    SuperSet(Bitmap),
    /// Intersection of all children.
    And,
    /// Union of all children.
    Or,
    /// `children[1] - children[0]`: subtracted set first, superset second.
    Not,
    /// Conjunction of volatile, user-driven constraints. Nothing evaluated
    /// beneath it participates in the result cache.
    UserFilter,
    /// Keys whose attribute equals a value.
    AttributeEquals {
        /// Index to read.
        index: Arc<AttributeIndex>,
        /// Value looked up.
        value: AttributeValue,
    },
    /// Keys whose attribute lies within bounds.
    AttributeRange {
        /// Index to read.
        index: Arc<AttributeIndex>,
        /// Lower bound.
        from: Bound<AttributeValue>,
        /// Upper bound.
        to: Bound<AttributeValue>,
    },
    /// Keys of entities carrying data in a locale.
    Locale {
        /// Index of entity locales keyed by locale name.
        index: Arc<AttributeIndex>,
        /// Locale looked up.
        locale: String,
    },
    /// Maps the child's keys through a reference index.
    Translate {
        /// Reference index to read.
        index: Arc<ReferenceIndex>,
        /// Mapping direction.
        direction: TranslationDirection,
    },
    /// Planner-supplied lazy result.
    Deferred(DeferredFormula),
}

impl FormulaKind {
    /// Stable small integer identifying the kind in structural hashes.
    #[must_use]
    pub const fn class_id(&self) -> u32 {
        match self {
            Self::Empty => 1,
            Self::Constant(_) => 2,
            Self::SuperSet(_) => 3,
            Self::And => 4,
            Self::Or => 5,
            Self::Not => 6,
            Self::UserFilter => 7,
            Self::AttributeEquals { .. } => 8,
            Self::AttributeRange { .. } => 9,
            Self::Locale { .. } => 10,
            Self::Translate { .. } => 11,
            Self::Deferred(_) => 12,
        }
    }

    /// Kind name used in diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Constant(_) => "constant",
            Self::SuperSet(_) => "super_set",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::UserFilter => "user_filter",
            Self::AttributeEquals { .. } => "attribute_equals",
            Self::AttributeRange { .. } => "attribute_range",
            Self::Locale { .. } => "locale",
            Self::Translate { .. } => "translate",
            Self::Deferred(_) => "deferred",
        }
    }

    /// Number of children the kind accepts.
    #[must_use]
    pub const fn arity(&self) -> Arity {
        match self {
            Self::And | Self::UserFilter => Arity::AtLeast(1),
            Self::Or => Arity::AtLeast(0),
            Self::Not => Arity::Exactly(2),
            Self::Translate { .. } => Arity::Exactly(1),
            Self::Empty
            | Self::Constant(_)
            | Self::SuperSet(_)
            | Self::AttributeEquals { .. }
            | Self::AttributeRange { .. }
            | Self::Locale { .. }
            | Self::Deferred(_) => Arity::Exactly(0),
        }
    }

    /// Returns true if results of this kind may be kept in the result cache.
    ///
    /// Direct lookups and literals are cheaper to recompute than to cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        match self {
            Self::And | Self::Or | Self::Not | Self::AttributeRange { .. } | Self::Translate { .. } => {
                true
            }
            Self::Deferred(deferred) => deferred.cacheable,
            Self::Empty
            | Self::Constant(_)
            | Self::SuperSet(_)
            | Self::UserFilter
            | Self::AttributeEquals { .. }
            | Self::Locale { .. } => false,
        }
    }

    /// Returns true if operand order does not change the result.
    #[must_use]
    pub const fn is_commutative(&self) -> bool {
        matches!(self, Self::And | Self::Or | Self::UserFilter)
    }

    /// Returns true if the kind intersects its children.
    #[must_use]
    pub const fn is_conjunctive(&self) -> bool {
        matches!(self, Self::And | Self::UserFilter)
    }

    /// Returns true if the optimizer must not pull the node into a
    /// synthetic memoization group.
    #[must_use]
    pub fn is_grouping_excluded(&self) -> bool {
        match self {
            Self::UserFilter | Self::Locale { .. } => true,
            Self::Deferred(deferred) => !deferred.cacheable,
            _ => false,
        }
    }

    /// Locale of an attribute predicate on a localized index.
    #[must_use]
    pub fn localized_locale(&self) -> Option<&str> {
        match self {
            Self::AttributeEquals { index, .. } | Self::AttributeRange { index, .. } => {
                index.locale()
            }
            _ => None,
        }
    }
}

/// One node of the arena with its memoized values.
struct FormulaNode {
    kind: FormulaKind,
    children: Vec<FormulaId>,
    attached: bool,
    attribute_snapshot: OnceCell<Arc<AttributeSnapshot>>,
    reference_snapshot: OnceCell<Arc<ReferenceSnapshot>>,
    hash: OnceCell<u64>,
    cardinality: OnceCell<u64>,
    cost: OnceCell<u64>,
    result: OnceCell<Bitmap>,
}

impl FormulaNode {
    fn new(kind: FormulaKind, children: Vec<FormulaId>) -> Self {
        Self {
            kind,
            children,
            attached: false,
            attribute_snapshot: OnceCell::new(),
            reference_snapshot: OnceCell::new(),
            hash: OnceCell::new(),
            cardinality: OnceCell::new(),
            cost: OnceCell::new(),
            result: OnceCell::new(),
        }
    }

    /// Pins the attribute index state read by this node.
    ///
    /// Hash, estimates and result all come from the first snapshot taken.
    fn attribute_snapshot(&self, index: &AttributeIndex) -> &Arc<AttributeSnapshot> {
        self.attribute_snapshot.get_or_init(|| index.snapshot())
    }

    fn reference_snapshot(&self, index: &ReferenceIndex) -> &Arc<ReferenceSnapshot> {
        self.reference_snapshot.get_or_init(|| index.snapshot())
    }
}

/// Arena holding the formula nodes of one query.
///
/// Every node has at most one parent, so the arena always describes a forest
/// of trees. A tree is `Send` but not `Sync`: it is evaluated by the thread
/// that owns the query.
///
/// # Panics
///
/// Leaf builders panic once the arena holds more than `u32::MAX` nodes;
/// [`FormulaTree::add`] reports the same condition as [`Error::Internal`].
#[derive(Default)]
pub struct FormulaTree {
    nodes: Vec<FormulaNode>,
}

impl FormulaTree {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the arena holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node after checking its arity and its children.
    ///
    /// # Errors
    ///
    /// - [`Error::Arity`] if the child count does not match the kind.
    /// - [`Error::Planning`] if a child is unknown or already has a parent.
    pub fn add(&mut self, kind: FormulaKind, children: Vec<FormulaId>) -> Result<FormulaId> {
        let arity = kind.arity();
        if !arity.accepts(children.len()) {
            return Err(Error::Arity {
                formula: kind.name(),
                expected: arity.to_string(),
                actual: children.len(),
            });
        }
        for (position, child) in children.iter().enumerate() {
            let node = self.node(*child)?;
            if node.attached || children[..position].contains(child) {
                return Err(Error::Planning(format!(
                    "formula {child} is already attached to a parent"
                )));
            }
        }
        let id = formula_id(self.nodes.len())?;
        for child in &children {
            self.nodes[child.index()].attached = true;
        }
        self.nodes.push(FormulaNode::new(kind, children));
        Ok(id)
    }

    /// Adds a copy of node `id` with a different set of children.
    ///
    /// # Errors
    ///
    /// Same as [`FormulaTree::add`], plus [`Error::Planning`] for an unknown id.
    pub fn clone_with_children(
        &mut self,
        id: FormulaId,
        children: Vec<FormulaId>,
    ) -> Result<FormulaId> {
        let kind = self.kind(id)?.clone();
        self.add(kind, children)
    }

    /// Kind of node `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Planning`] for an unknown id.
    pub fn kind(&self, id: FormulaId) -> Result<&FormulaKind> {
        self.node(id).map(|node| &node.kind)
    }

    /// Children of node `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Planning`] for an unknown id.
    pub fn children(&self, id: FormulaId) -> Result<&[FormulaId]> {
        self.node(id).map(|node| node.children.as_slice())
    }

    fn node(&self, id: FormulaId) -> Result<&FormulaNode> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| Error::Planning(format!("unknown formula {id}")))
    }

    // ---------------------------------------------------------------------
    // Builders
    // ---------------------------------------------------------------------

    fn leaf(&mut self, kind: FormulaKind) -> FormulaId {
        // Leaf builders are infallible: overflowing the id space is treated
        // like a `Vec` capacity overflow.
        let id = match formula_id(self.nodes.len()) {
            Ok(id) => id,
            Err(e) => panic!("{e}"),
        };
        self.nodes.push(FormulaNode::new(kind, Vec::new()));
        id
    }

    /// The empty set.
    pub fn empty(&mut self) -> FormulaId {
        self.leaf(FormulaKind::Empty)
    }

    /// A literal set of keys.
    pub fn constant(&mut self, keys: Bitmap) -> FormulaId {
        self.leaf(FormulaKind::Constant(keys))
    }

    /// The universe of the queried collection.
    pub fn super_set(&mut self, universe: Bitmap) -> FormulaId {
        self.leaf(FormulaKind::SuperSet(universe))
    }

    /// Keys whose attribute equals `value`.
    pub fn attribute_equals(
        &mut self,
        index: &Arc<AttributeIndex>,
        value: impl Into<AttributeValue>,
    ) -> FormulaId {
        self.leaf(FormulaKind::AttributeEquals {
            index: Arc::clone(index),
            value: value.into(),
        })
    }

    /// Keys whose attribute lies within `from..to`.
    pub fn attribute_range(
        &mut self,
        index: &Arc<AttributeIndex>,
        from: Bound<AttributeValue>,
        to: Bound<AttributeValue>,
    ) -> FormulaId {
        self.leaf(FormulaKind::AttributeRange {
            index: Arc::clone(index),
            from,
            to,
        })
    }

    /// Keys of entities carrying data in `locale`.
    pub fn locale(&mut self, index: &Arc<AttributeIndex>, locale: impl Into<String>) -> FormulaId {
        self.leaf(FormulaKind::Locale {
            index: Arc::clone(index),
            locale: locale.into(),
        })
    }

    /// A planner-supplied lazy result.
    pub fn deferred(&mut self, deferred: DeferredFormula) -> FormulaId {
        self.leaf(FormulaKind::Deferred(deferred))
    }

    /// Intersection of `children`.
    ///
    /// # Errors
    ///
    /// See [`FormulaTree::add`].
    pub fn and(&mut self, children: Vec<FormulaId>) -> Result<FormulaId> {
        self.add(FormulaKind::And, children)
    }

    /// Union of `children`. No children yields the empty set.
    ///
    /// # Errors
    ///
    /// See [`FormulaTree::add`].
    pub fn or(&mut self, children: Vec<FormulaId>) -> Result<FormulaId> {
        self.add(FormulaKind::Or, children)
    }

    /// `superset - subtracted`.
    ///
    /// # Errors
    ///
    /// See [`FormulaTree::add`].
    pub fn not(&mut self, subtracted: FormulaId, superset: FormulaId) -> Result<FormulaId> {
        self.add(FormulaKind::Not, vec![subtracted, superset])
    }

    /// Conjunction of volatile constraints excluded from caching.
    ///
    /// # Errors
    ///
    /// See [`FormulaTree::add`].
    pub fn user_filter(&mut self, children: Vec<FormulaId>) -> Result<FormulaId> {
        self.add(FormulaKind::UserFilter, children)
    }

    /// Maps the keys computed by `child` through `index`.
    ///
    /// # Errors
    ///
    /// See [`FormulaTree::add`].
    pub fn translate(
        &mut self,
        index: &Arc<ReferenceIndex>,
        direction: TranslationDirection,
        child: FormulaId,
    ) -> Result<FormulaId> {
        self.add(
            FormulaKind::Translate {
                index: Arc::clone(index),
                direction,
            },
            vec![child],
        )
    }
}

/// Id of the node stored at arena position `position`.
pub(crate) fn formula_id(position: usize) -> Result<FormulaId> {
    u32::try_from(position)
        .map(FormulaId)
        .map_err(|_| Error::Internal("formula arena exceeds u32::MAX nodes".to_string()))
}

impl fmt::Debug for FormulaTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.nodes
                    .iter()
                    .map(|node| (node.kind.name(), node.children.as_slice())),
            )
            .finish()
    }
}

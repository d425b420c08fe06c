//! Tree-to-tree rewrite preparing formulas for memoization.
//!
//! The optimizer walks the source tree with an explicit [`RewriteScope`]
//! passed by value and builds a new tree that computes the same keys:
//!
//! - nested conjunctions are flattened into their conjunctive ancestor,
//! - locale filters already implied by a localized attribute predicate in the
//!   same conjunctive scope are dropped,
//! - conjunctive siblings that can be cached are grouped under one synthetic
//!   `And` when they sit next to nodes that must stay outside the group, so
//!   the group becomes a reusable cache unit.

use rustc_hash::FxHashSet;
use tracing::trace;

use super::{FormulaId, FormulaKind, FormulaTree};
use crate::error::{Error, Result};

/// Position of a node relative to the conjunctive operators above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteScope {
    /// The node is reachable from the root only through conjunctive nodes.
    pub conjunctive: bool,
    /// The node lies beneath a user filter.
    pub within_user_filter: bool,
}

impl RewriteScope {
    /// Scope of the root node.
    pub const ROOT: Self = Self {
        conjunctive: true,
        within_user_filter: false,
    };

    /// Scope of the children of a node of `kind`.
    #[must_use]
    pub fn enter(self, kind: &FormulaKind) -> Self {
        Self {
            conjunctive: self.conjunctive && kind.is_conjunctive(),
            within_user_filter: self.within_user_filter
                || matches!(kind, FormulaKind::UserFilter),
        }
    }
}

/// Result of [`FormulaOptimizer::optimize`].
#[derive(Debug)]
pub struct OptimizedFormula {
    /// Rewritten arena.
    pub tree: FormulaTree,
    /// Root of the rewritten formula inside `tree`.
    pub root: FormulaId,
}

/// Rewrites formula trees into an equivalent, cache-friendly shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormulaOptimizer;

impl FormulaOptimizer {
    /// Creates an optimizer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Rewrites the formula rooted at `root` into a new arena.
    ///
    /// # Errors
    ///
    /// - [`Error::Planning`] for unknown ids.
    /// - [`Error::Arity`] if a rebuilt node ends up with an invalid child count.
    pub fn optimize(&self, source: &FormulaTree, root: FormulaId) -> Result<OptimizedFormula> {
        let mut covered_locales = FxHashSet::default();
        collect_localized(source, root, RewriteScope::ROOT, &mut covered_locales)?;

        let mut rewriter = Rewriter {
            source,
            target: FormulaTree::new(),
            covered_locales,
        };
        let root = rewriter
            .rewrite(root, RewriteScope::ROOT)?
            .ok_or_else(|| Error::Internal("optimizer dropped the whole formula".to_string()))?;

        Ok(OptimizedFormula {
            tree: rewriter.target,
            root,
        })
    }
}

/// Collects the locales of localized attribute predicates in conjunctive scope.
fn collect_localized(
    tree: &FormulaTree,
    id: FormulaId,
    scope: RewriteScope,
    locales: &mut FxHashSet<String>,
) -> Result<()> {
    let kind = tree.kind(id)?;
    if scope.conjunctive {
        if let Some(locale) = kind.localized_locale() {
            locales.insert(locale.to_string());
        }
    }
    let child_scope = scope.enter(kind);
    for child in tree.children(id)? {
        collect_localized(tree, *child, child_scope, locales)?;
    }
    Ok(())
}

struct Rewriter<'a> {
    source: &'a FormulaTree,
    target: FormulaTree,
    covered_locales: FxHashSet<String>,
}

impl Rewriter<'_> {
    /// Rewrites `id`; `None` means the node is redundant and was dropped.
    fn rewrite(&mut self, id: FormulaId, scope: RewriteScope) -> Result<Option<FormulaId>> {
        let kind = self.source.kind(id)?;
        match kind {
            FormulaKind::Locale { locale, .. }
                if scope.conjunctive && self.covered_locales.contains(locale) =>
            {
                trace!(formula = %id, locale = %locale, "Dropping subsumed locale filter");
                Ok(None)
            }
            FormulaKind::And if scope.conjunctive => self.rewrite_conjunction(id, scope),
            _ => {
                let child_scope = scope.enter(kind);
                let mut children = Vec::new();
                for child in self.source.children(id)? {
                    if let Some(rewritten) = self.rewrite(*child, child_scope)? {
                        children.push(rewritten);
                    }
                }
                if children.is_empty() && !kind.arity().accepts(0) {
                    return Ok(None);
                }
                self.target.add(kind.clone(), children).map(Some)
            }
        }
    }

    fn rewrite_conjunction(
        &mut self,
        id: FormulaId,
        scope: RewriteScope,
    ) -> Result<Option<FormulaId>> {
        let mut conjuncts = Vec::new();
        self.flatten_conjunction(id, &mut conjuncts)?;

        let child_scope = scope.enter(&FormulaKind::And);
        let mut groupable = Vec::new();
        let mut excluded = Vec::new();
        for conjunct in conjuncts {
            let is_excluded = self.source.kind(conjunct)?.is_grouping_excluded();
            if let Some(rewritten) = self.rewrite(conjunct, child_scope)? {
                if is_excluded {
                    excluded.push(rewritten);
                } else {
                    groupable.push(rewritten);
                }
            }
        }

        let mut children =
            if !scope.within_user_filter && groupable.len() >= 2 && !excluded.is_empty() {
                trace!(
                    formula = %id,
                    grouped = groupable.len(),
                    "Grouping conjunctive siblings for memoization"
                );
                vec![self.target.and(groupable)?]
            } else {
                groupable
            };
        children.extend(excluded);

        match children.len() {
            0 => Ok(None),
            1 => Ok(children.pop()),
            _ => self.target.and(children).map(Some),
        }
    }

    /// Collects the operands of `id` and of every `And` directly beneath it.
    fn flatten_conjunction(&self, id: FormulaId, conjuncts: &mut Vec<FormulaId>) -> Result<()> {
        for child in self.source.children(id)? {
            if matches!(self.source.kind(*child)?, FormulaKind::And) {
                self.flatten_conjunction(*child, conjuncts)?;
            } else {
                conjuncts.push(*child);
            }
        }
        Ok(())
    }
}

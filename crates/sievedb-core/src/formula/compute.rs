//! Lazy, memoized evaluation of formula trees.

use tracing::trace;

use super::translate::translate;
use super::{FormulaId, FormulaKind, FormulaNode, FormulaTree};
use crate::bitmap::Bitmap;
use crate::cache::{CacheEngine, CacheKey, CacheScope};
use crate::error::Result;
use crate::index::AttributeValue;

/// Where and how a tree is evaluated.
///
/// The context is a small value copied into every recursive call; entering a
/// [`FormulaKind::UserFilter`] produces a copy that no longer consults the
/// result cache.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    engine: Option<&'a CacheEngine>,
    scope: CacheScope,
    cacheable: bool,
}

impl<'a> EvaluationContext<'a> {
    /// Evaluates without any result cache.
    #[must_use]
    pub fn uncached() -> Self {
        Self {
            engine: None,
            scope: CacheScope::GLOBAL,
            cacheable: false,
        }
    }

    /// Evaluates through `engine`, keying results within `scope`.
    #[must_use]
    pub fn cached(engine: &'a CacheEngine, scope: CacheScope) -> Self {
        Self {
            engine: Some(engine),
            scope,
            cacheable: true,
        }
    }

    /// Scope discriminator mixed into cache keys.
    #[must_use]
    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    fn within_user_filter(self) -> Self {
        Self {
            cacheable: false,
            ..self
        }
    }
}

impl FormulaTree {
    /// Computes the keys of node `id`.
    ///
    /// Idempotent: the first result is memoized and returned by every later
    /// call. A node estimated at zero keys returns the canonical empty bitmap
    /// without consulting the cache.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::Planning`] if estimates are missing.
    /// - [`crate::Error::CacheComputation`] if a shared computation this call
    ///   waited for failed.
    pub fn compute(&self, id: FormulaId, ctx: &EvaluationContext<'_>) -> Result<Bitmap> {
        let node = self.node(id)?;
        if let Some(result) = node.result.get() {
            return Ok(result.clone());
        }

        let result = if self.estimated_cardinality(id)? == 0 {
            Bitmap::empty()
        } else {
            match ctx.engine {
                Some(engine) if ctx.cacheable && node.kind.is_cacheable() => {
                    let cost = self.estimated_cost(id)?;
                    if engine.admits(cost) {
                        let key = CacheKey::new(self.structural_hash(id)?, ctx.scope);
                        engine.get_or_compute(key, cost, || self.compute_uncached(node, ctx))?
                    } else {
                        trace!(formula = %id, cost, "Formula below complexity threshold");
                        self.compute_uncached(node, ctx)?
                    }
                }
                _ => self.compute_uncached(node, ctx)?,
            }
        };

        Ok(node.result.get_or_init(|| result).clone())
    }

    fn compute_uncached(&self, node: &FormulaNode, ctx: &EvaluationContext<'_>) -> Result<Bitmap> {
        match &node.kind {
            FormulaKind::Empty => Ok(Bitmap::empty()),
            FormulaKind::Constant(keys) | FormulaKind::SuperSet(keys) => Ok(keys.clone()),
            FormulaKind::And => self.intersect(&node.children, ctx),
            FormulaKind::UserFilter => self.intersect(&node.children, &ctx.within_user_filter()),
            FormulaKind::Or => self.union(&node.children, ctx),
            FormulaKind::Not => {
                let superset = self.compute(node.children[1], ctx)?;
                if superset.is_empty() {
                    return Ok(Bitmap::empty());
                }
                let subtracted = self.compute(node.children[0], ctx)?;
                Ok(superset.and_not(&subtracted))
            }
            FormulaKind::AttributeEquals { index, value } => {
                Ok(node.attribute_snapshot(index).equals(value))
            }
            FormulaKind::AttributeRange { index, from, to } => {
                let buckets = node
                    .attribute_snapshot(index)
                    .range(from.as_ref(), to.as_ref());
                Ok(Bitmap::or_all(&buckets))
            }
            FormulaKind::Locale { index, locale } => Ok(node
                .attribute_snapshot(index)
                .equals(&AttributeValue::String(locale.clone()))),
            FormulaKind::Translate { index, direction } => {
                let keys = self.compute(node.children[0], ctx)?;
                let snapshot = node.reference_snapshot(index);
                Ok(translate(&keys, |key| snapshot.lookup(*direction, key)))
            }
            FormulaKind::Deferred(deferred) => Ok(deferred.supply()),
        }
    }

    /// Intersects children from the smallest estimate up, stopping at the
    /// first empty intermediate result.
    fn intersect(&self, children: &[FormulaId], ctx: &EvaluationContext<'_>) -> Result<Bitmap> {
        let mut ordered = children
            .iter()
            .map(|child| Ok((self.estimated_cardinality(*child)?, *child)))
            .collect::<Result<Vec<_>>>()?;
        ordered.sort_unstable();

        let mut acc: Option<Bitmap> = None;
        for (_, child) in ordered {
            let keys = self.compute(child, ctx)?;
            let next = match acc {
                None => keys,
                Some(current) => current.and(&keys),
            };
            if next.is_empty() {
                return Ok(Bitmap::empty());
            }
            acc = Some(next);
        }
        Ok(acc.unwrap_or_default())
    }

    /// Unions children; a super set operand is returned as is.
    fn union(&self, children: &[FormulaId], ctx: &EvaluationContext<'_>) -> Result<Bitmap> {
        for child in children {
            if let FormulaKind::SuperSet(universe) = self.kind(*child)? {
                return Ok(universe.clone());
            }
        }
        let computed = children
            .iter()
            .map(|child| self.compute(*child, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Bitmap::or_all(&computed))
    }
}

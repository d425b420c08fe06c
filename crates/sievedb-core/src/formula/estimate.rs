//! Cardinality and cost estimates.
//!
//! Estimated cardinalities are upper bounds of the real result size, which
//! lets evaluation skip any node estimated at zero. Costs follow a simple
//! linear model: a per-element operation cost times the cardinalities of the
//! inputs, plus the cost of computing the inputs.

use super::{FormulaId, FormulaKind, FormulaTree};
use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::index::AttributeValue;

/// Cost of reading one bucket from an index.
pub(crate) const LOOKUP_COST: u64 = 1;
/// Per-element cost of intersecting inputs.
pub(crate) const AND_OPERATION_COST: u64 = 15;
/// Per-element cost of unioning inputs.
pub(crate) const OR_OPERATION_COST: u64 = 13;
/// Per-element cost of subtracting inputs.
pub(crate) const NOT_OPERATION_COST: u64 = 14;
/// Per-key cost of translating keys through a reference index.
pub(crate) const TRANSLATE_OPERATION_COST: u64 = 52;

impl FormulaTree {
    /// Upper bound of the number of keys node `id` computes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Planning`] for an unknown id or a deferred formula
    /// without estimates.
    pub fn estimated_cardinality(&self, id: FormulaId) -> Result<u64> {
        let node = self.node(id)?;
        if let Some(cardinality) = node.cardinality.get() {
            return Ok(*cardinality);
        }

        let cardinality = match &node.kind {
            FormulaKind::Empty => 0,
            FormulaKind::Constant(keys) | FormulaKind::SuperSet(keys) => keys.len(),
            FormulaKind::And | FormulaKind::UserFilter => {
                Bitmap::estimated_and_cardinality(self.children_cardinalities(id)?)
            }
            FormulaKind::Or => Bitmap::estimated_or_cardinality(self.children_cardinalities(id)?),
            FormulaKind::Not => self.estimated_cardinality(node.children[1])?,
            FormulaKind::AttributeEquals { index, value } => {
                node.attribute_snapshot(index).equals(value).len()
            }
            FormulaKind::AttributeRange { index, from, to } => {
                let buckets = node
                    .attribute_snapshot(index)
                    .range(from.as_ref(), to.as_ref());
                Bitmap::estimated_or_cardinality(buckets.iter().map(Bitmap::len))
            }
            FormulaKind::Locale { index, locale } => node
                .attribute_snapshot(index)
                .equals(&AttributeValue::String(locale.clone()))
                .len(),
            FormulaKind::Translate { index, direction } => {
                let keys = self.estimated_cardinality(node.children[0])?;
                let fan_out = node.reference_snapshot(index).average_fan_out(*direction);
                keys.saturating_mul(fan_out)
            }
            FormulaKind::Deferred(deferred) => deferred.estimated_cardinality.ok_or_else(|| {
                Error::Planning(format!(
                    "deferred formula '{}' has no cardinality estimate",
                    deferred.label
                ))
            })?,
        };

        Ok(*node.cardinality.get_or_init(|| cardinality))
    }

    /// Estimated cost of computing node `id`, including its children.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Planning`] for an unknown id or a deferred formula
    /// without estimates.
    pub fn estimated_cost(&self, id: FormulaId) -> Result<u64> {
        let node = self.node(id)?;
        if let Some(cost) = node.cost.get() {
            return Ok(*cost);
        }

        let mut children_cost = 0u64;
        for child in &node.children {
            children_cost = children_cost.saturating_add(self.estimated_cost(*child)?);
        }
        let inputs = Bitmap::estimated_or_cardinality(self.children_cardinalities(id)?);

        let own_cost = match &node.kind {
            FormulaKind::Empty => 0,
            FormulaKind::Constant(_)
            | FormulaKind::SuperSet(_)
            | FormulaKind::AttributeEquals { .. }
            | FormulaKind::Locale { .. } => LOOKUP_COST,
            FormulaKind::And | FormulaKind::UserFilter => inputs.saturating_mul(AND_OPERATION_COST),
            FormulaKind::Or => inputs.saturating_mul(OR_OPERATION_COST),
            FormulaKind::Not => inputs.saturating_mul(NOT_OPERATION_COST),
            FormulaKind::AttributeRange { index, from, to } => {
                let buckets = node
                    .attribute_snapshot(index)
                    .range(from.as_ref(), to.as_ref());
                let keys = Bitmap::estimated_or_cardinality(buckets.iter().map(Bitmap::len));
                (buckets.len() as u64)
                    .saturating_mul(LOOKUP_COST)
                    .saturating_add(keys.saturating_mul(OR_OPERATION_COST))
            }
            FormulaKind::Translate { .. } => inputs.saturating_mul(TRANSLATE_OPERATION_COST),
            FormulaKind::Deferred(deferred) => deferred.estimated_cost.ok_or_else(|| {
                Error::Planning(format!(
                    "deferred formula '{}' has no cost estimate",
                    deferred.label
                ))
            })?,
        };

        let cost = own_cost.saturating_add(children_cost);
        Ok(*node.cost.get_or_init(|| cost))
    }

    fn children_cardinalities(&self, id: FormulaId) -> Result<Vec<u64>> {
        self.children(id)?
            .iter()
            .map(|child| self.estimated_cardinality(*child))
            .collect()
    }
}

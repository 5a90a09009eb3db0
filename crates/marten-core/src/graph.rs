use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::value::Value;

// Graph nodes: the recorded vector-Jacobian products of one operator
//
// When an operator produces a Value that requires gradients, it records a
// GraphNode next to it. The node holds the operand Values themselves
// (Arc handles, cheap to clone) and one backward closure per operand.
// Given the upstream gradient of the result, closure i returns the
// gradient contribution for operand i, already expressed in operand i's
// shape.
//
// Operands are shared handles, so the graph is a DAG: the same leaf may
// appear under many nodes, and a node keeps its operands alive for exactly
// as long as it is replayable. Releasing the node (after a non-retained
// backward pass) drops those references.

/// Unique identifier for a value. Keys the per-pass gradient map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u64);

impl Default for ValueId {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueId {
    /// Generate a new unique value ID (uses a global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        ValueId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A backward rule: `(upstream, operands) -> contribution` for one operand.
pub type BackwardFn<B> = Arc<dyn Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync>;

/// The VJP record of one operator application.
pub struct GraphNode<B: Backend> {
    op: String,
    operands: Vec<Value<B>>,
    rules: Vec<BackwardFn<B>>,
}

impl<B: Backend> GraphNode<B> {
    /// Build a node; `rules[i]` differentiates with respect to `operands[i]`.
    pub fn new(op: impl Into<String>, operands: Vec<Value<B>>, rules: Vec<BackwardFn<B>>) -> Result<Self> {
        let op = op.into();
        if operands.len() != rules.len() {
            return Err(Error::ArityMismatch {
                op,
                operands: operands.len(),
                rules: rules.len(),
            });
        }
        Ok(GraphNode {
            op,
            operands,
            rules,
        })
    }

    /// The operator name, for diagnostics.
    pub fn op(&self) -> &str {
        &self.op
    }

    pub fn operands(&self) -> &[Value<B>] {
        &self.operands
    }

    pub fn arity(&self) -> usize {
        self.operands.len()
    }

    pub(crate) fn into_operands(self) -> Vec<Value<B>> {
        self.operands
    }

    /// Gradient contribution for operand `index` given the result's upstream gradient.
    ///
    /// The contribution must come back in the operand's exact shape.
    pub fn vjp(&self, index: usize, upstream: &Value<B>) -> Result<Value<B>> {
        let (Some(operand), Some(rule)) = (self.operands.get(index), self.rules.get(index)) else {
            return Err(Error::msg(format!(
                "operand {} out of range for '{}' with {} operands",
                index,
                self.op,
                self.arity()
            )));
        };
        let contribution = rule(upstream, &self.operands)?;
        if contribution.shape() != operand.shape() {
            return Err(Error::ShapeMismatch {
                expected: operand.shape().clone(),
                got: contribution.shape().clone(),
            });
        }
        Ok(contribution)
    }
}

impl<B: Backend> fmt::Debug for GraphNode<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("op", &self.op)
            .field("operands", &self.operands)
            .finish()
    }
}

/// Replay state of the node behind a value.
///
///   Leaf ─────────────────────────── (no node, nothing to release)
///   Unevaluated ──backward──▶ Propagating ──┬─ retained ──▶ Unevaluated
///                                           └─ released ──▶ Consumed
pub(crate) enum NodeState<B: Backend> {
    Leaf,
    Unevaluated(Arc<GraphNode<B>>),
    Propagating(Arc<GraphNode<B>>),
    Consumed { op: String },
}

impl<B: Backend> NodeState<B> {
    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, NodeState::Leaf)
    }
}

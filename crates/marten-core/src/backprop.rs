// Backpropagation: reverse-mode automatic differentiation
//
// HOW IT WORKS:
//
//   1. Forward pass: operators on Values build a DAG. Every derived value
//      that requires grad carries a GraphNode holding its operands and one
//      backward closure per operand.
//
//   2. backward(upstream) topologically sorts the reachable part of the DAG
//      (only values that require grad), marking each node Propagating.
//
//   3. Walking the order in reverse (root first, leaves last), each value
//      receives the SUM of all contributions from its consumers, adds it to
//      its GradNode, then asks its node for the contribution of every
//      operand that requires grad (the vector-Jacobian products).
//
//   4. Each node then either returns to Unevaluated (retained, replayable)
//      or becomes Consumed, dropping its operands and closures.
//
// RETENTION:
//
//   A pass is retained when BackwardConfig::keep_graph is set or the root has
//   create_graph. Retained passes run with grad mode ON, so every gradient
//   they compute is itself a differentiable Value: backward on an
//   expression built from .grad() gives Hessian-vector products. Released
//   passes run with grad mode OFF and leave plain, detached gradients.
//
// ACCUMULATION:
//
//   A value used in several places gets the sum of every edge's
//   contribution (multivariate chain rule). For c = a * a:
//   grad_a = grad_c * a + grad_c * a = 2 * a * grad_c.
//   Across passes, GradNodes keep summing until reset.

use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::graph::{GraphNode, NodeState, ValueId};
use crate::value::Value;

/// Settings of one backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardConfig {
    keep_graph: bool,
}

impl BackwardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep every traversed graph node replayable after the pass.
    pub fn with_keep_graph(mut self, keep_graph: bool) -> Self {
        self.keep_graph = keep_graph;
        self
    }

    pub fn keep_graph(&self) -> bool {
        self.keep_graph
    }
}

// Grad mode

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operators on this thread currently record graph nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

struct GradModeGuard {
    previous: bool,
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|g| g.set(self.previous));
    }
}

/// Run `f` with graph recording switched on or off, restoring the previous
/// mode afterwards (also on unwind).
pub fn with_grad_mode<T>(enabled: bool, f: impl FnOnce() -> T) -> T {
    let _guard = GradModeGuard {
        previous: GRAD_ENABLED.with(|g| g.replace(enabled)),
    };
    f()
}

/// Run `f` without recording graph nodes. Results never require grad.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    with_grad_mode(false, f)
}

// Node state transitions

/// Unevaluated → Propagating. Leaves have no node and stay untouched.
fn begin_propagation<B: Backend>(value: &Value<B>) -> Result<Option<Arc<GraphNode<B>>>> {
    let mut state = value.node_state()?;
    match &*state {
        NodeState::Leaf => Ok(None),
        NodeState::Unevaluated(node) => {
            let node = Arc::clone(node);
            *state = NodeState::Propagating(Arc::clone(&node));
            Ok(Some(node))
        }
        NodeState::Propagating(node) => Err(Error::GraphInUse {
            op: node.op().to_string(),
        }),
        NodeState::Consumed { op } => Err(Error::GraphConsumed { op: op.clone() }),
    }
}

/// Propagating → Unevaluated (retain) or Consumed (release).
fn end_propagation<B: Backend>(value: &Value<B>, release: bool) -> Result<()> {
    let mut state = value.node_state()?;
    if let NodeState::Propagating(node) = &*state {
        *state = if release {
            NodeState::Consumed {
                op: node.op().to_string(),
            }
        } else {
            NodeState::Unevaluated(Arc::clone(node))
        };
    }
    Ok(())
}

/// A traversed value and the node it was propagating through.
struct Visit<B: Backend> {
    value: Value<B>,
    node: Option<Arc<GraphNode<B>>>,
}

/// Build a topological ordering of the part of the graph that needs gradients.
///
/// Depth-first from the root with an explicit stack; every value appears
/// AFTER all its operands (leaves first, root last) and exactly once, however
/// many paths reach it. On error every node already marked Propagating is put
/// back.
fn build_topo<B: Backend>(root: &Value<B>) -> Result<Vec<Visit<B>>> {
    let mut order = Vec::new();
    let mut marked = Vec::new();
    if let Err(e) = collect_topo(root, &mut order, &mut marked) {
        for v in &marked {
            end_propagation(v, false)?;
        }
        return Err(e);
    }
    Ok(order)
}

enum Step<B: Backend> {
    Enter(Value<B>),
    Exit(Visit<B>),
}

fn collect_topo<B: Backend>(
    root: &Value<B>,
    order: &mut Vec<Visit<B>>,
    marked: &mut Vec<Value<B>>,
) -> Result<()> {
    let mut visited = HashSet::new();
    let mut stack = vec![Step::Enter(root.clone())];
    while let Some(step) = stack.pop() {
        let value = match step {
            Step::Exit(visit) => {
                order.push(visit);
                continue;
            }
            Step::Enter(value) => value,
        };
        if !visited.insert(value.id()) {
            continue;
        }
        let node = begin_propagation(&value)?;
        let operands: Vec<Value<B>> = match &node {
            Some(node) => {
                marked.push(value.clone());
                node.operands()
                    .iter()
                    .filter(|operand| operand.requires_grad())
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        };
        stack.push(Step::Exit(Visit { value, node }));
        stack.extend(operands.into_iter().rev().map(Step::Enter));
    }
    Ok(())
}

/// Backpropagate `upstream` from `root` into every reachable GradNode.
///
/// This is the entry point behind `Value::backward*`.
pub fn backward<B: Backend>(root: &Value<B>, upstream: &Value<B>, config: &BackwardConfig) -> Result<()> {
    if upstream.shape() != root.shape() {
        return Err(Error::ShapeMismatch {
            expected: root.shape().clone(),
            got: upstream.shape().clone(),
        });
    }
    if !root.requires_grad() {
        log::debug!("backward from '{}' skipped: it does not require grad", root.label());
        return Ok(());
    }

    let retain = config.keep_graph() || root.create_graph();
    let topo = build_topo(root)?;
    log::debug!(
        "backward from '{}' {}: {} values, retain graph = {}",
        root.label(),
        root.shape(),
        topo.len(),
        retain
    );

    let mut propagated = HashSet::new();
    let result = with_grad_mode(retain, || propagate(&topo, root, upstream, &mut propagated));

    // Nodes the pass never reached stay replayable, even after an error.
    for visit in topo.iter().filter(|v| v.node.is_some()) {
        let release = !retain && propagated.contains(&visit.value.id());
        end_propagation(&visit.value, release)?;
    }
    if let Err(e) = &result {
        log::debug!("backward from '{}' aborted: {}", root.label(), e);
    }
    result
}

fn propagate<B: Backend>(
    topo: &[Visit<B>],
    root: &Value<B>,
    upstream: &Value<B>,
    propagated: &mut HashSet<ValueId>,
) -> Result<()> {
    let mut pending: HashMap<ValueId, Value<B>> = HashMap::new();
    pending.insert(root.id(), upstream.clone());

    for Visit { value, node } in topo.iter().rev() {
        let Some(grad) = pending.remove(&value.id()) else {
            continue;
        };
        value.accumulate_grad(grad.clone())?;

        let Some(node) = node else {
            continue;
        };
        log::trace!("propagating '{}' {} through {} operands", node.op(), value.shape(), node.arity());
        for (i, operand) in node.operands().iter().enumerate() {
            if !operand.requires_grad() {
                continue;
            }
            let contribution = node.vjp(i, &grad)?;
            match pending.entry(operand.id()) {
                Entry::Occupied(mut e) => {
                    let sum = e.get().add(&contribution)?;
                    e.insert(sum);
                }
                Entry::Vacant(e) => {
                    e.insert(contribution);
                }
            }
        }
        propagated.insert(value.id());
    }
    Ok(())
}

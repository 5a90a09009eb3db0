use std::borrow::Cow;
use std::sync::Arc;

use crate::backend::{Backend, BackendStorage};
use crate::error::{Error, Result};
use crate::graph::BackwardFn;
use crate::shape::Shape;
use crate::value::{ForwardBinaryFn, Value};

// Broadcast-aware wrapping of elementwise binary operators
//
// Backend kernels only combine equally shaped storages. When the operands
// of an elementwise operator differ, but one of them already has the
// broadcast shape S, the operator is rewritten around the plan:
//
//   forward:   the smaller operand is repeated up to S, then the kernel runs
//   backward:  the rule's contribution for the smaller operand (shaped like
//              S) is summed over the repeated axes back to the operand shape
//
// The sum over the `scale = numel(S) / numel(operand)` repeated copies is
// the whole correction; no extra factor is applied on top of it.
//
// Shapes that do not broadcast at all fall through to the operator's own
// shape map (and usually to a backend error). Shapes that broadcast to
// something neither operand has, like [2, 1] with [1, 3], are rejected:
// growing both sides is not supported.

/// How two operand shapes meet at a common broadcast shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    target: Shape,
    lhs: Shape,
    rhs: Shape,
}

impl BroadcastPlan {
    /// `Ok(None)` when no broadcasting applies (equal or incompatible shapes).
    pub fn new(lhs: &Shape, rhs: &Shape) -> Result<Option<Self>> {
        if lhs == rhs {
            return Ok(None);
        }
        let Ok(target) = Shape::broadcast_shape(lhs, rhs) else {
            return Ok(None);
        };
        if &target != lhs && &target != rhs {
            return Err(Error::BroadcastIncompatible {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                target,
            });
        }
        Ok(Some(BroadcastPlan {
            target,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }))
    }

    /// The common shape of the result.
    pub fn target(&self) -> &Shape {
        &self.target
    }

    /// How many copies of `operand` make up the target.
    pub fn scale(&self, operand: &Shape) -> usize {
        match operand.elem_count() {
            0 => 0,
            n => self.target.elem_count() / n,
        }
    }

    pub(crate) fn wrap_forward<B: Backend>(
        &self,
        forward: ForwardBinaryFn<B>,
        device: B::Device,
    ) -> ForwardBinaryFn<B> {
        let target = self.target.clone();
        Arc::new(move |lhs: &B::Storage, rhs: &B::Storage| {
            let lhs = expand::<B>(lhs, &target, &device)?;
            let rhs = expand::<B>(rhs, &target, &device)?;
            forward(&lhs, &rhs)
        })
    }

    pub(crate) fn wrap_backward<B: Backend>(&self, rules: [BackwardFn<B>; 2]) -> [BackwardFn<B>; 2] {
        let [this, other] = rules;
        [
            self.reducing(this, self.lhs.clone()),
            self.reducing(other, self.rhs.clone()),
        ]
    }

    fn reducing<B: Backend>(&self, rule: BackwardFn<B>, operand: Shape) -> BackwardFn<B> {
        if operand == self.target {
            return rule;
        }
        let scale = self.scale(&operand);
        Arc::new(move |upstream: &Value<B>, operands: &[Value<B>]| {
            let contribution = rule(upstream, operands)?;
            if contribution.shape() == &operand {
                return Ok(contribution);
            }
            log::trace!(
                "summing broadcast gradient {} down to {} ({} copies)",
                contribution.shape(),
                operand,
                scale
            );
            contribution.sum_to(&operand)
        })
    }
}

fn expand<'a, B: Backend>(
    storage: &'a B::Storage,
    target: &Shape,
    device: &B::Device,
) -> Result<Cow<'a, B::Storage>> {
    if storage.shape() == target {
        Ok(Cow::Borrowed(storage))
    } else {
        Ok(Cow::Owned(B::broadcast_to(storage, target, device)?))
    }
}

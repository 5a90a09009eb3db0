use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use once_cell::sync::OnceCell;

use crate::backend::{Backend, BackendStorage, NativeGradientFn};
use crate::backprop::{self, is_grad_enabled, BackwardConfig};
use crate::broadcast::BroadcastPlan;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::grad_node::GradNode;
use crate::graph::{BackwardFn, GraphNode, NodeState, ValueId};
use crate::shape::Shape;

// Value: one node of the differentiable expression graph
//
// A Value is what every operator consumes and produces. It carries:
//
//   1. A shape, dtype and device, known eagerly at construction
//   2. Its data, produced lazily (a leaf's supplier or an operator's
//      kernel) and memoised: the first reader computes it behind a
//      one-time barrier, later readers see the cached storage
//   3. requires_grad / create_graph flags
//   4. The replay state of the graph node that produced it (none for leaves)
//   5. A gradient accumulator
//
// MEMORY MODEL:
//
//   Value is a handle around Arc<ValueInner>, so clones are O(1) and graph
//   nodes share operands instead of copying them. A derived value lists its
//   inputs next to its forward kernel; both are dropped once the data is
//   cached, so an evaluated value only keeps its operands alive through its
//   graph node.
//
//   Reading data forces every missing ancestor first, leaves first, from an
//   explicit worklist. Dropping walks the other way the same way. Neither
//   depends on the depth of the graph.
//
//   Gradients stored by a retained pass are graphs over the values they
//   differentiate, leaves included. Those leaves stay alive until
//   reset_grad() drops the gradient.
//
//   Storage sits behind a RwLock inside the OnceCell: concurrent readers
//   share it, and inline operators (mul_, fill_, ...) take the write lock.

/// Produces a leaf's data on first access.
pub type DataSupplier<B> = Arc<dyn Fn() -> Result<<B as Backend>::Storage> + Send + Sync>;

/// Forward computation of a unary operator.
pub type ForwardUnaryFn<B> =
    Arc<dyn Fn(&<B as Backend>::Storage) -> Result<<B as Backend>::Storage> + Send + Sync>;

/// Forward computation of a binary operator.
pub type ForwardBinaryFn<B> = Arc<
    dyn Fn(&<B as Backend>::Storage, &<B as Backend>::Storage) -> Result<<B as Backend>::Storage>
        + Send
        + Sync,
>;

type ForwardFn<B> =
    Arc<dyn Fn(&[&<B as Backend>::Storage]) -> Result<<B as Backend>::Storage> + Send + Sync>;

/// Where a value's data comes from until it is cached.
#[derive(Clone)]
enum Source<B: Backend> {
    Supplier(DataSupplier<B>),
    Derived {
        inputs: Vec<Value<B>>,
        forward: ForwardFn<B>,
    },
}

fn arity_error(op: &str, expected: usize, got: usize) -> Error {
    Error::msg(format!("'{}' expects {} inputs, got {}", op, expected, got))
}

struct ValueInner<B: Backend> {
    id: ValueId,
    /// Diagnostic name: "leaf" or the operator that produced the value.
    label: String,
    shape: Shape,
    dtype: DType,
    device: B::Device,
    data: OnceCell<RwLock<B::Storage>>,
    source: Mutex<Option<Source<B>>>,
    requires_grad: AtomicBool,
    create_graph: AtomicBool,
    /// Set on values that wrap a backend's own gradient.
    native_gradient: bool,
    node: Mutex<NodeState<B>>,
    grad: Mutex<GradNode<B>>,
}

impl<B: Backend> ValueInner<B> {
    fn new(label: impl Into<String>, shape: Shape, dtype: DType, device: B::Device) -> Self {
        ValueInner {
            id: ValueId::new(),
            label: label.into(),
            shape,
            dtype,
            device,
            data: OnceCell::new(),
            source: Mutex::new(None),
            requires_grad: AtomicBool::new(false),
            create_graph: AtomicBool::new(false),
            native_gradient: false,
            node: Mutex::new(NodeState::Leaf),
            grad: Mutex::new(GradNode::new()),
        }
    }

    /// Unlink every value this one holds: data inputs, graph operands and
    /// the stored gradient.
    fn take_links(&mut self) -> Vec<Value<B>> {
        let mut links = Vec::new();
        let source = self.source.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(Source::Derived { inputs, .. }) = source.take() {
            links.extend(inputs);
        }
        let state = self.node.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let NodeState::Unevaluated(node) | NodeState::Propagating(node) =
            std::mem::replace(state, NodeState::Leaf)
        {
            if let Ok(node) = Arc::try_unwrap(node) {
                links.extend(node.into_operands());
            }
        }
        let grad = self.grad.get_mut().unwrap_or_else(PoisonError::into_inner);
        links.extend(grad.take_grad());
        links
    }
}

impl<B: Backend> Drop for ValueInner<B> {
    fn drop(&mut self) {
        let mut pending = self.take_links();
        while let Some(value) = pending.pop() {
            if let Ok(mut inner) = Arc::try_unwrap(value.inner) {
                pending.extend(inner.take_links());
            }
        }
    }
}

/// A differentiable, lazily evaluated tensor value on backend `B`.
///
/// # Example
/// ```ignore
/// use marten_cpu::{CpuBackend, CpuDevice};
///
/// let dev = CpuDevice::default();
/// let x = Value::<CpuBackend>::from_f64_slice(&[0.5], (), DType::F64, &dev)?.requires_grad_(true)?;
/// let z = x.mul(&x)?;
/// z.backward()?;
/// assert_eq!(x.grad().unwrap().to_scalar_f64()?, 1.0);
/// ```
pub struct Value<B: Backend> {
    inner: Arc<ValueInner<B>>,
}

impl<B: Backend> Clone for Value<B> {
    fn clone(&self) -> Self {
        Value {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Value<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Value(id={:?}, label={}, shape={}, dtype={}, requires_grad={})",
            self.inner.id,
            self.inner.label,
            self.inner.shape,
            self.inner.dtype,
            self.requires_grad(),
        )
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| Error::msg("value lock poisoned"))
}

impl<B: Backend> Value<B> {
    // Leaf constructors

    /// Build a leaf whose data comes from `supplier` on first access.
    ///
    /// The produced storage must have the declared shape and dtype; a
    /// mismatch surfaces as [`Error::InvalidShape`] (or `DTypeMismatch`)
    /// from the first data access, not from this call.
    pub fn create_leaf(
        supplier: impl Fn() -> Result<B::Storage> + Send + Sync + 'static,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
        requires_grad: bool,
        create_graph: bool,
    ) -> Self {
        let mut inner = ValueInner::new("leaf", shape.into(), dtype, device.clone());
        inner.source = Mutex::new(Some(Source::Supplier(Arc::new(supplier))));
        inner.create_graph = AtomicBool::new(create_graph);
        let value = Value {
            inner: Arc::new(inner),
        };
        value.init_requires_grad(requires_grad);
        value
    }

    /// Wrap already computed storage as a leaf that does not require grad.
    pub fn from_storage(storage: B::Storage, device: &B::Device) -> Self {
        let mut inner = ValueInner::new(
            "leaf",
            storage.shape().clone(),
            storage.dtype(),
            device.clone(),
        );
        inner.data = OnceCell::with_value(RwLock::new(storage));
        Value {
            inner: Arc::new(inner),
        }
    }

    /// Create a leaf from a flat row-major slice.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != data.len() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, &shape, dtype, device)?;
        Ok(Self::from_storage(storage, device))
    }

    /// Create a leaf filled with a constant value.
    pub fn full(shape: impl Into<Shape>, val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        let storage = B::full(&shape.into(), val, dtype, device)?;
        Ok(Self::from_storage(storage, device))
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let storage = B::zeros(&shape.into(), dtype, device)?;
        Ok(Self::from_storage(storage, device))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let storage = B::ones(&shape.into(), dtype, device)?;
        Ok(Self::from_storage(storage, device))
    }

    /// A scalar (shape `[]`) leaf.
    pub fn scalar(val: f64, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(Shape::scalar(), val, dtype, device)
    }

    /// A leaf with standard normal entries.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let storage = B::rand_normal(&shape.into(), 0.0, 1.0, dtype, device)?;
        Ok(Self::from_storage(storage, device))
    }

    /// Wrap a backend-native gradient.
    fn native(storage: B::Storage, device: &B::Device) -> Self {
        let mut inner = ValueInner::new("native_grad", storage.shape().clone(), storage.dtype(), device.clone());
        inner.native_gradient = true;
        inner.data = OnceCell::with_value(RwLock::new(storage));
        Value {
            inner: Arc::new(inner),
        }
    }

    /// A new leaf holding a copy of this value's data, outside any graph.
    pub fn detach(&self) -> Result<Self> {
        let storage = self.storage()?.clone();
        Ok(Self::from_storage(storage, self.device()))
    }

    // Accessors

    pub fn id(&self) -> ValueId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    /// Size of dimension `d`.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.inner.shape.dim(d)
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad.load(Ordering::SeqCst)
    }

    /// Whether backward passes rooted here record their own gradients in the graph.
    pub fn create_graph(&self) -> bool {
        self.inner.create_graph.load(Ordering::SeqCst)
    }

    /// True for values that did not come out of a recorded operator.
    pub fn is_leaf(&self) -> bool {
        self.inner
            .node
            .lock()
            .map(|node| node.is_leaf())
            .unwrap_or(false)
    }

    /// True for gradients reported by the backend rather than propagated.
    pub fn is_native_gradient(&self) -> bool {
        self.inner.native_gradient
    }

    // Data access

    fn cell(&self) -> Result<&RwLock<B::Storage>> {
        if let Some(cell) = self.inner.data.get() {
            return Ok(cell);
        }
        for pending in self.unevaluated_ancestors()? {
            pending.init_data()?;
        }
        self.init_data()
    }

    fn init_data(&self) -> Result<&RwLock<B::Storage>> {
        self.inner
            .data
            .get_or_try_init(|| self.evaluate().map(RwLock::new))
    }

    /// This value and every ancestor without cached data, inputs before
    /// the values computed from them.
    fn unevaluated_ancestors(&self) -> Result<Vec<Value<B>>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if value.inner.data.get().is_some() || !seen.insert(value.id()) {
                continue;
            }
            let inputs = match &*lock(&value.inner.source)? {
                Some(Source::Derived { inputs, .. }) => inputs.clone(),
                _ => Vec::new(),
            };
            stack.push((value, true));
            stack.extend(inputs.into_iter().map(|input| (input, false)));
        }
        Ok(order)
    }

    fn evaluate(&self) -> Result<B::Storage> {
        let source = lock(&self.inner.source)?
            .clone()
            .ok_or_else(|| Error::msg(format!("value '{}' has no data", self.label())))?;
        let storage = match &source {
            Source::Supplier(supplier) => supplier()?,
            Source::Derived { inputs, forward } => {
                let guards = inputs
                    .iter()
                    .map(|input| input.storage())
                    .collect::<Result<Vec<_>>>()?;
                let args: Vec<&B::Storage> = guards.iter().map(|guard| &**guard).collect();
                forward(&args)?
            }
        };
        if storage.shape() != self.shape() {
            return Err(Error::InvalidShape {
                declared: self.shape().clone(),
                actual: storage.shape().clone(),
            });
        }
        if storage.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: storage.dtype(),
            });
        }
        *lock(&self.inner.source)? = None;
        Ok(storage)
    }

    /// Read access to the data, evaluating it on first use.
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.cell()?
            .read()
            .map_err(|_| Error::msg("value storage lock poisoned"))
    }

    /// Copy the data to a flat row-major Vec<f64>.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(&*self.storage()?)
    }

    /// The single element of a one-element value.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        let data = self.to_f64_vec()?;
        match data.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::ShapeMismatch {
                expected: Shape::scalar(),
                got: self.shape().clone(),
            }),
        }
    }

    // Operator application

    /// Apply a unary operator.
    ///
    /// `forward` runs lazily on this value's data; `shape_map` gives the
    /// result shape eagerly. When the result requires grad, `backward`
    /// becomes the sole rule of its graph node.
    pub fn apply_unary(
        &self,
        forward: impl Fn(&B::Storage) -> Result<B::Storage> + Send + Sync + 'static,
        backward: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
        op: &str,
        shape_map: impl FnOnce(&Shape) -> Result<Shape>,
    ) -> Result<Self> {
        let shape = shape_map(self.shape())?;
        let forward: ForwardUnaryFn<B> = Arc::new(forward);
        let name = op.to_string();
        let kernel: ForwardFn<B> = Arc::new(move |args: &[&B::Storage]| match args {
            [input] => forward(*input),
            _ => Err(arity_error(&name, 1, args.len())),
        });
        let rule: BackwardFn<B> = Arc::new(backward);
        Self::derive(op, shape, self, vec![self.clone()], vec![rule], kernel)
    }

    /// Apply an elementwise binary operator, broadcasting mismatched shapes.
    ///
    /// When the two shapes broadcast to one of them, the smaller operand is
    /// expanded before `forward` runs and its gradient is summed back to its
    /// own shape after the backward rule. Otherwise `shape_map` decides.
    pub fn apply_binary(
        &self,
        other: &Value<B>,
        forward: impl Fn(&B::Storage, &B::Storage) -> Result<B::Storage> + Send + Sync + 'static,
        backward_this: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
        backward_other: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
        op: &str,
        shape_map: impl FnOnce(&Shape, &Shape) -> Result<Shape>,
    ) -> Result<Self> {
        let forward: ForwardBinaryFn<B> = Arc::new(forward);
        let rules: [BackwardFn<B>; 2] = [Arc::new(backward_this), Arc::new(backward_other)];
        match BroadcastPlan::new(self.shape(), other.shape())? {
            Some(plan) => {
                log::trace!("{}: broadcasting {} and {} to {}", op, self.shape(), other.shape(), plan.target());
                let forward = plan.wrap_forward::<B>(forward, self.device().clone());
                let rules = plan.wrap_backward::<B>(rules);
                self.binary(other, forward, rules, op, plan.target().clone())
            }
            None => {
                let shape = shape_map(self.shape(), other.shape())?;
                self.binary(other, forward, rules, op, shape)
            }
        }
    }

    /// Apply a binary operator whose operand shapes are not elementwise
    /// aligned (e.g. matmul). No broadcasting is attempted.
    pub fn apply_binary_exact(
        &self,
        other: &Value<B>,
        forward: impl Fn(&B::Storage, &B::Storage) -> Result<B::Storage> + Send + Sync + 'static,
        backward_this: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
        backward_other: impl Fn(&Value<B>, &[Value<B>]) -> Result<Value<B>> + Send + Sync + 'static,
        op: &str,
        shape_map: impl FnOnce(&Shape, &Shape) -> Result<Shape>,
    ) -> Result<Self> {
        let shape = shape_map(self.shape(), other.shape())?;
        let forward: ForwardBinaryFn<B> = Arc::new(forward);
        let rules: [BackwardFn<B>; 2] = [Arc::new(backward_this), Arc::new(backward_other)];
        self.binary(other, forward, rules, op, shape)
    }

    fn binary(
        &self,
        other: &Value<B>,
        forward: ForwardBinaryFn<B>,
        rules: [BackwardFn<B>; 2],
        op: &str,
        shape: Shape,
    ) -> Result<Self> {
        if self.dtype() != other.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: other.dtype(),
            });
        }
        let name = op.to_string();
        let kernel: ForwardFn<B> = Arc::new(move |args: &[&B::Storage]| match args {
            [lhs, rhs] => forward(*lhs, *rhs),
            _ => Err(arity_error(&name, 2, args.len())),
        });
        Self::derive(
            op,
            shape,
            self,
            vec![self.clone(), other.clone()],
            Vec::from(rules),
            kernel,
        )
    }

    /// Build a derived value. A graph node is attached only when the result
    /// requires grad, i.e. grad mode is on and some operand requires grad.
    fn derive(
        op: &str,
        shape: Shape,
        first: &Value<B>,
        operands: Vec<Value<B>>,
        rules: Vec<BackwardFn<B>>,
        forward: ForwardFn<B>,
    ) -> Result<Self> {
        let requires_grad = is_grad_enabled() && operands.iter().any(|o| o.requires_grad());
        let create_graph = operands.iter().any(|o| o.create_graph());
        let mut inner = ValueInner::new(op, shape, first.dtype(), first.device().clone());
        inner.source = Mutex::new(Some(Source::Derived {
            inputs: operands.clone(),
            forward,
        }));
        inner.requires_grad = AtomicBool::new(requires_grad);
        inner.create_graph = AtomicBool::new(create_graph);
        if requires_grad {
            let node = GraphNode::new(op, operands, rules)?;
            inner.node = Mutex::new(NodeState::Unevaluated(Arc::new(node)));
        }
        Ok(Value {
            inner: Arc::new(inner),
        })
    }

    /// Mutate the data in place. The result must keep this value's shape.
    ///
    /// The graph is not updated: other paths that already read the old data,
    /// or backward rules that will, see whatever is stored at that time.
    pub fn apply_inline_unary(
        &self,
        f: impl FnOnce(&B::Storage) -> Result<B::Storage>,
    ) -> Result<Self> {
        let cell = self.cell()?;
        let mut guard = cell
            .write()
            .map_err(|_| Error::msg("value storage lock poisoned"))?;
        let updated = f(&guard)?;
        if updated.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: updated.shape().clone(),
            });
        }
        *guard = updated;
        Ok(self.clone())
    }

    /// Mutate the data in place using another value's data.
    pub fn apply_inline_binary(
        &self,
        other: &Value<B>,
        f: impl FnOnce(&B::Storage, &B::Storage) -> Result<B::Storage>,
    ) -> Result<Self> {
        // Copy out first: `other` may be `self`.
        let rhs = other.storage()?.clone();
        self.apply_inline_unary(|lhs| f(lhs, &rhs))
    }

    // Gradient tracking

    /// Turn gradient tracking on or off for a leaf.
    ///
    /// Turning it on installs the backend's native gradient supplier when the
    /// backend has one. Derived values fail with [`Error::NotALeaf`].
    pub fn requires_grad_(&self, requires_grad: bool) -> Result<Self> {
        if !self.is_leaf() {
            return Err(Error::NotALeaf {
                label: self.label().to_string(),
            });
        }
        self.init_requires_grad(requires_grad);
        Ok(self.clone())
    }

    /// Mark a leaf so that backward passes rooted at values derived from it
    /// keep their graphs and record gradient computations.
    pub fn create_graph_(&self, create_graph: bool) -> Result<Self> {
        if !self.is_leaf() {
            return Err(Error::NotALeaf {
                label: self.label().to_string(),
            });
        }
        self.inner.create_graph.store(create_graph, Ordering::SeqCst);
        Ok(self.clone())
    }

    fn init_requires_grad(&self, requires_grad: bool) {
        self.inner.requires_grad.store(requires_grad, Ordering::SeqCst);
        let supplier = if requires_grad && B::supports_native_gradient() {
            Some(self.native_gradient_supplier())
        } else {
            None
        };
        if let Ok(mut grad) = self.inner.grad.lock() {
            grad.set_native_gradient(supplier);
        }
    }

    fn native_gradient_supplier(&self) -> NativeGradientFn<B> {
        // Weak: the supplier lives inside this value's own GradNode.
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move || match weak.upgrade() {
            Some(inner) => {
                let value = Value { inner };
                let storage = value.storage()?;
                B::native_gradient(&storage)
            }
            None => Ok(None),
        })
    }

    /// The accumulated gradient, or `None` if no contribution arrived yet.
    ///
    /// A native gradient from the backend wins over the propagated one when
    /// a supplier is installed, not disabled, and reports data.
    pub fn grad(&self) -> Option<Value<B>> {
        let (propagated, native) = match self.inner.grad.lock() {
            Ok(node) => (node.grad(), node.native_gradient()),
            Err(_) => return None,
        };
        if let Some(supplier) = native {
            match supplier() {
                Ok(Some(storage)) => return Some(Value::native(storage, self.device())),
                Ok(None) => {}
                Err(e) => log::warn!(
                    "native gradient of '{}' unavailable, using propagated gradient: {}",
                    self.label(),
                    e
                ),
            }
        }
        propagated
    }

    /// Drop the accumulated gradient.
    ///
    /// Gradients left by a retained pass reference the graph they came
    /// from, this value included; resetting releases that graph.
    pub fn reset_grad(&self) -> Result<()> {
        lock(&self.inner.grad)?.reset();
        Ok(())
    }

    /// Ignore the backend-native gradient and always report the propagated one.
    pub fn set_disable_native_gradient(&self, disable: bool) -> Result<()> {
        lock(&self.inner.grad)?.set_disable_native_gradient(disable);
        Ok(())
    }

    /// Install a custom native gradient supplier for this value.
    pub fn set_native_gradient_supplier(
        &self,
        supplier: impl Fn() -> Result<Option<B::Storage>> + Send + Sync + 'static,
    ) -> Result<()> {
        lock(&self.inner.grad)?.set_native_gradient(Some(Arc::new(supplier)));
        Ok(())
    }

    pub(crate) fn accumulate_grad(&self, contribution: Value<B>) -> Result<()> {
        if contribution.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: contribution.shape().clone(),
            });
        }
        let stored = {
            let mut node = lock(&self.inner.grad)?;
            node.accumulate(contribution)?;
            node.grad()
        };
        // Outside a recording pass the gradient is a constant. Computing it
        // now drops its references to the values it was derived from.
        if !is_grad_enabled() {
            if let Some(grad) = stored {
                grad.cell()?;
            }
        }
        Ok(())
    }

    pub(crate) fn node_state(&self) -> Result<MutexGuard<'_, NodeState<B>>> {
        lock(&self.inner.node)
    }

    // Backward

    /// Backpropagate from a single-element value with an implicit seed of one.
    pub fn backward(&self) -> Result<()> {
        self.backward_config(&BackwardConfig::default())
    }

    /// Like [`Value::backward`], with explicit retention settings.
    pub fn backward_config(&self, config: &BackwardConfig) -> Result<()> {
        if self.elem_count() != 1 {
            return Err(Error::AmbiguousSeed {
                shape: self.shape().clone(),
            });
        }
        let seed = Value::ones(self.shape().clone(), self.dtype(), self.device())?;
        backprop::backward(self, &seed, config)
    }

    /// Backpropagate `upstream`, which must have this value's shape.
    pub fn backward_with(&self, upstream: &Value<B>) -> Result<()> {
        backprop::backward(self, upstream, &BackwardConfig::default())
    }

    pub fn backward_with_config(&self, upstream: &Value<B>, config: &BackwardConfig) -> Result<()> {
        backprop::backward(self, upstream, config)
    }
}

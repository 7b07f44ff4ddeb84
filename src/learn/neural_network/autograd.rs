use super::{
    layer::Forward,
    optimizer::{State as OptimizerState, Value as OptimizerValue},
};
#[cfg(doc)]
use crate::learn::neural_network::optimizer::Optimizer;
use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{
    linalg::Dot, ArcArray, ArrayViewMutD, Axis, Dimension, IntoDimension, Ix0, Ix1, Ix2, Ix3,
    Ix4, IxDyn, ShapeError, Slice, Zip,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    any::TypeId,
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use gradnotes::{result::Result, learn::neural_network::autograd::{Variable, Variable2}};
    /// # use ndarray::ArcArray2;
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcArray2<f32>| -> Result<ArcArray2<f32>> { todo!() });
    /// }
    /// let output_value: ArcArray2<f32> = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if edges are not added.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(GradLock::default());
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the gradient of `node`
        /// given the gradient of `self`.
        /// When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcArray<f32, D>) -> Result<ArcArray<f32, D2>> + Send + Sync + 'static,
        {
            let output_grad_lock = self.grad.get_or_insert_with(GradLock::default).clone();
            let mut output_grad_lock = Some(output_grad_lock);
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || -> Result<()> {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let output_grad = output_grad_lock.read().clone();
                    std::mem::drop(output_grad_lock);
                    let output_grad = match output_grad {
                        Some(output_grad) => output_grad.into_dimensionality::<D>()?,
                        None => bail!("{name}: output gradient was not computed!"),
                    };
                    let grad = (f)(output_grad)?;
                    ensure!(
                        grad.shape() == dim.slice(),
                        "{name}: gradient shape {:?} != {:?}",
                        grad.shape(),
                        dim.slice()
                    );
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

impl Debug for NodeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("dim", &self.dim.slice())
            .field("edges", &self.edges.lock().len())
            .finish()
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass.
    ///
    /// The gradient of `self` is initialized with ones.
    pub fn backward(&self) -> Result<()> {
        let grad = ArcArray::<f32, _>::ones(self.inner.dim.clone()).into_dimensionality::<D>()?;
        self.backward_grad(grad)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the gradient was already computed.
    pub fn backward_grad(&self, grad: ArcArray<f32, D>) -> Result<()> {
        ensure!(
            grad.shape() == self.inner.dim.slice(),
            "Expected grad shape {:?}, found {:?}!",
            self.inner.dim.slice(),
            grad.shape()
        );
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node)
                }
            }
        }
        Ok(())
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are arrays with an optional [`Node`] that stores a gradient. Numerical operations
/// on variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients. Operations on variables without a node do not build a graph.
///
/// Variables can be created from arrays via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 3 dimensions
pub type Variable3 = Variable<Ix3>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension + 'static> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Converts the variable into an array.
    pub fn into_value(self) -> ArcArray<f32, D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Whether a gradient will be computed for the variable.
    pub fn requires_grad(&self) -> bool {
        self.node.is_some()
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: Forward>(self, f: &F) -> Result<VariableD> {
        f.forward(self.into_dyn())
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dimensionality),
        }
    }
    /// Converts into `shape`.
    ///
    /// The elements are read in logical (row major) order.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, E::Dim>| {
                Ok(standard_layout(output_grad).into_shape(dim)?)
            });
        }
        let value = standard_layout(self.value).into_shape(shape)?;
        Ok(builder.build(value))
    }
    /// Flattens the variable into 2 dimensions, (batch_size, features).
    pub fn flatten(self) -> Result<Variable2> {
        let (batch_size, features) = match self.shape().split_first() {
            Some((batch_size, rest)) => (*batch_size, rest.iter().product()),
            None => bail!("Can not flatten a 0 dimensional variable!"),
        };
        self.into_shape([batch_size, features])
    }
    /// Reverses (transposes) the axes of the variable.
    pub fn reversed_axes(self) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, |output_grad| Ok(output_grad.reversed_axes()));
        }
        builder.build(self.value.reversed_axes())
    }
    /// Transposes the variable.
    pub fn t(&self) -> Self {
        self.clone().reversed_axes()
    }
    /// Permutes the axes of the variable.
    pub fn permuted_axes<A>(self, axes: A) -> Self
    where
        A: IntoDimension<Dim = D>,
    {
        let mut builder = Self::builder();
        let axes = axes.into_dimension();
        let mut input_axes = D::zeros(axes.ndim());
        for (i, a) in axes.slice().iter().copied().enumerate() {
            input_axes[a] = i;
        }
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.permuted_axes(input_axes))
            });
        }
        builder.build(self.value.permuted_axes(axes))
    }
    /// Broadcasts the variable into `dim`.
    ///
    /// The gradient is summed over the broadcasted axes.
    pub fn broadcast<E>(&self, dim: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = dim.into_dimension();
        let value = match self.value.broadcast(dim.clone()) {
            Some(value) => value.to_owned().into_shared(),
            None => bail!("Can not broadcast {:?} -> {:?}!", self.shape(), dim.slice()),
        };
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            let input_dim = self.raw_dim();
            builder.edge(node, move |output_grad| {
                broadcast_backward(output_grad, input_dim)
            });
        }
        Ok(builder.build(value))
    }
    /// Adds `rhs`, broadcasting it to the shape of `self` if necessary.
    pub fn add<D2>(&self, rhs: &Variable<D2>) -> Result<Self>
    where
        D2: Dimension + 'static,
    {
        let rhs = if self.shape() == rhs.shape() {
            rhs.clone().into_dimensionality::<D>()?
        } else {
            rhs.broadcast(self.raw_dim())?
        };
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            builder.edge(node, Ok);
        }
        let value = (&self.value + &rhs.value).into_shared();
        Ok(builder.build(value))
    }
    /// Subtracts `rhs`.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        ensure!(
            self.shape() == rhs.shape(),
            "Can not subtract {:?} from {:?}!",
            rhs.shape(),
            self.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, Ok);
        }
        if let Some(node) = rhs.node() {
            builder.edge(node, |output_grad| Ok(output_grad.mapv(|dy| -dy).into_shared()));
        }
        let value = (&self.value - &rhs.value).into_shared();
        Ok(builder.build(value))
    }
    /// Multiplies elementwise with `rhs`.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        ensure!(
            self.shape() == rhs.shape(),
            "Can not multiply {:?} with {:?}!",
            self.shape(),
            rhs.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let rhs = rhs.value.clone();
            builder.edge(node, move |output_grad| Ok((&output_grad * &rhs).into_shared()));
        }
        if let Some(node) = rhs.node() {
            let lhs = self.value.clone();
            builder.edge(node, move |output_grad| Ok((&output_grad * &lhs).into_shared()));
        }
        let value = (&self.value * &rhs.value).into_shared();
        Ok(builder.build(value))
    }
    /// Multiplies by `alpha`.
    pub fn scaled(&self, alpha: f32) -> Self {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.mapv(|dy| alpha * dy).into_shared())
            });
        }
        builder.build(self.value.mapv(|x| alpha * x).into_shared())
    }
    fn unary<F, G>(&self, f: F, df: G) -> Self
    where
        F: Fn(f32) -> f32,
        G: Fn(f32, f32) -> f32 + Send + Sync + 'static,
    {
        let output = self.value.mapv(f).into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let input = self.value.clone();
            let output = output.clone();
            builder.edge(node, move |output_grad| {
                let mut input_grad = output_grad.into_owned();
                Zip::from(&mut input_grad)
                    .and(&input)
                    .and(&output)
                    .for_each(|dx, x, y| *dx *= df(*x, *y));
                Ok(input_grad.into_shared())
            });
        }
        builder.build(output)
    }
    /// Rectified linear unit, `max(x, 0)`.
    pub fn relu(&self) -> Self {
        self.unary(|x| x.max(0.), |x, _| if x > 0. { 1. } else { 0. })
    }
    /// Leaky relu, `x` if `x > 0` else `alpha * x`.
    pub fn leaky_relu(&self, alpha: f32) -> Self {
        self.unary(
            move |x| if x > 0. { x } else { alpha * x },
            move |x, _| if x > 0. { 1. } else { alpha },
        )
    }
    /// Logistic sigmoid.
    pub fn sigmoid(&self) -> Self {
        self.unary(sigmoid, |_, y| y * (1. - y))
    }
    /// Hyperbolic tangent.
    pub fn tanh(&self) -> Self {
        self.unary(f32::tanh, |_, y| 1. - y * y)
    }
    /// Slices `len` elements of `axis` starting at `start`.
    pub fn narrow(&self, axis: Axis, start: usize, len: usize) -> Result<Self> {
        let size = self.value.len_of(axis);
        ensure!(
            start + len <= size,
            "Can not narrow {start}..{} of axis {} with size {size}!",
            start + len,
            axis.index()
        );
        let slice = Slice::from(start..start + len);
        let value = self
            .value
            .slice_axis(axis, slice)
            .as_standard_layout()
            .into_owned()
            .into_shared();
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad| {
                let mut input_grad = ArcArray::zeros(dim);
                input_grad.slice_axis_mut(axis, slice).assign(&output_grad);
                Ok(input_grad)
            });
        }
        Ok(builder.build(value))
    }
    /// Stacks `variables` along a new `axis`.
    pub fn stack(axis: Axis, variables: &[Self]) -> Result<Variable<D::Larger>>
    where
        D::Larger: 'static,
    {
        ensure!(!variables.is_empty(), "Can not stack 0 variables!");
        let views: Vec<_> = variables.iter().map(|x| x.value.view()).collect();
        let value = ndarray::stack(axis, &views)?.into_shared();
        let mut builder = Variable::builder();
        for (i, variable) in variables.iter().enumerate() {
            if let Some(node) = variable.node() {
                builder.edge(node, move |output_grad: ArcArray<f32, D::Larger>| {
                    Ok(output_grad
                        .index_axis(axis, i)
                        .to_owned()
                        .into_dimensionality::<D>()?
                        .into_shared())
                });
            }
        }
        Ok(builder.build(value))
    }
    /// Sums all the elements.
    pub fn sum(&self) -> Variable0 {
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            let dim = self.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(ArcArray::from_elem(dim, output_grad[()]))
            });
        }
        builder.build(ndarray::arr0(self.value.sum()).into_shared())
    }
    /// The mean of all the elements.
    pub fn mean(&self) -> Variable0 {
        let len = self.value.len().max(1);
        self.sum().scaled(1. / len as f32)
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
    /// The value as a scalar.
    pub fn scalar(&self) -> f32 {
        self.value[()]
    }
}

impl Dot<Self> for Variable2 {
    type Output = Result<Self>;
    fn dot(&self, rhs: &Self) -> Result<Self> {
        let lhs = self;
        ensure!(
            lhs.shape()[1] == rhs.shape()[0],
            "Can not multiply {:?} by {:?}!",
            lhs.shape(),
            rhs.shape()
        );
        let mut builder = Self::builder();
        if let Some(node) = lhs.node() {
            let rhs = rhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(output_grad.dot(&rhs.t()).into_shared())
            });
        }
        if let Some(node) = rhs.node() {
            let lhs = lhs.value().clone();
            builder.edge(node, move |output_grad| {
                Ok(lhs.t().dot(&output_grad).into_shared())
            });
        }
        let value = lhs.value().dot(rhs.value()).into_shared();
        Ok(builder.build(value))
    }
}

impl<D: Dimension> From<ndarray::Array<f32, D>> for Variable<D> {
    fn from(array: ndarray::Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

pub(crate) fn standard_layout<D: Dimension>(array: ArcArray<f32, D>) -> ArcArray<f32, D> {
    if array.is_standard_layout() {
        array
    } else {
        array.as_standard_layout().into_owned().into_shared()
    }
}

fn broadcast_backward<E: Dimension, D: Dimension>(
    output_grad: ArcArray<f32, E>,
    input_dim: D,
) -> Result<ArcArray<f32, D>> {
    let mut grad = output_grad.into_dyn().into_owned();
    while grad.ndim() > input_dim.ndim() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, size) in input_dim.slice().iter().copied().enumerate() {
        if size == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    Ok(grad.into_dimensionality::<D>()?.into_shared())
}

/// Parameter.
///
/// Parameter values are updated during training by the [`Optimizer`]. A Parameter
/// can be converted to a [`Variable`] via [`.to_variable()`](Parameter::to_variable),
/// which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`].
/// A parameter stores the [`OptimizerState`] which is updated in [`Optimizer::update`].
/// Training progress may be saved by serializing with [`serde`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))]
pub struct Parameter<D: Dimension> {
    value: ArcArray<f32, D>,
    #[serde(skip)]
    grad: Option<GradLock>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    optimizer_state: Option<OptimizerState>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with 2 dimensions.
pub type Parameter2 = Parameter<Ix2>;
/// Parameter with 4 dimensions.
pub type Parameter4 = Parameter<Ix4>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension + 'static> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// The gradient of the parameter.
    ///
    /// Only available when training, after the backward pass.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether the parameter has no elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(GradLock::default());
        } else if !training {
            self.grad = None;
        }
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optimizer_state.as_ref()
    }
    /// Converts to a `Variable`.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
    /// Makes a mutable parameter view.
    ///
    /// Copies the value if it is shared, so that variables computed from the previous value are
    /// not modified.
    pub fn make_view_mut(&mut self) -> ParameterViewMut {
        let grad = self.grad.as_ref().and_then(|grad| grad.read().clone());
        ParameterViewMut {
            value: self.value.view_mut().into_dyn(),
            grad,
            optimizer_state: &mut self.optimizer_state,
        }
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            optimizer_state: self.optimizer_state,
        }
    }
}

impl<D: Dimension> From<ndarray::Array<f32, D>> for Parameter<D> {
    fn from(array: ndarray::Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Parameter<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            grad: None,
            optimizer_state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("shape", &self.value.shape())
            .field("training", &self.grad.is_some())
            .field("optimizer_state", &self.optimizer_state)
            .finish()
    }
}

/// Mutable parameter view.
///
/// Created with [`Parameter::make_view_mut()`] and passed to [`Optimizer::update`].
pub struct ParameterViewMut<'a> {
    value: ArrayViewMutD<'a, f32>,
    grad: Option<ArcArray<f32, IxDyn>>,
    optimizer_state: &'a mut Option<OptimizerState>,
}

impl ParameterViewMut<'_> {
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The gradient, if computed.
    pub fn grad(&self) -> Option<&ArcArray<f32, IxDyn>> {
        self.grad.as_ref()
    }
    /// Borrows the value mutably.
    pub fn value_view_mut(&mut self) -> ArrayViewMutD<f32> {
        self.value.view_mut()
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optimizer_state.as_ref()
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_view_optimizer_state_mut(
        &mut self,
    ) -> (ArrayViewMutD<f32>, Option<&mut OptimizerState>) {
        (self.value.view_mut(), self.optimizer_state.as_mut())
    }
    /// Initializes the optimizer state.
    ///
    /// The `name` should be the name of the optimizer, for example "SGD".
    /// The `id` is the [`TypeId`] of the optimizer.
    pub fn init_optimizer_state(
        &mut self,
        name: impl Into<String>,
        id: TypeId,
        key_values: impl IntoIterator<Item = (String, OptimizerValue)>,
    ) -> Result<()> {
        let state = OptimizerState::new(
            self.value.shape(),
            name.into(),
            id,
            key_values.into_iter().collect(),
        )?;
        self.optimizer_state.replace(state);
        Ok(())
    }
}

impl Debug for ParameterViewMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParameterViewMut")
            .field("shape", &self.value.shape())
            .field("grad", &self.grad.is_some())
            .field("optimizer_state", &self.optimizer_state)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::ArrayD;

    /// Compares the gradient of `f` at `x` with central differences.
    pub(crate) fn check_gradient<D, F>(x: ndarray::Array<f32, D>, f: F)
    where
        D: Dimension + 'static,
        F: Fn(Variable<D>) -> Result<Variable0>,
    {
        let mut parameter = Parameter::from(x.clone());
        parameter.set_training(true);
        let y = f(parameter.to_variable()).unwrap();
        y.backward().unwrap();
        let grad = parameter.grad().unwrap();
        let eps = 1e-2;
        let mut numerical = ArrayD::<f32>::zeros(x.raw_dim().into_dyn());
        for (i, dx) in numerical.iter_mut().enumerate() {
            let mut x_plus = x.clone();
            x_plus.as_slice_mut().unwrap()[i] += eps;
            let mut x_minus = x.clone();
            x_minus.as_slice_mut().unwrap()[i] -= eps;
            let y_plus = f(Variable::from(x_plus)).unwrap().scalar();
            let y_minus = f(Variable::from(x_minus)).unwrap().scalar();
            *dx = (y_plus - y_minus) / (2. * eps);
        }
        assert_relative_eq!(
            grad.into_dyn(),
            numerical.into_shared(),
            epsilon = 1e-2,
            max_relative = 1e-2
        );
    }
}

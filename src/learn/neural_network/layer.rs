use super::{
    autograd::{standard_layout, Parameter, ParameterD, Variable, Variable1, Variable4, VariableD},
    optimizer::Optimizer,
};
use crate::result::Result;
use anyhow::{bail, ensure};
#[doc(hidden)]
pub use gradnotes_derive::*;
use kernels::Conv2Options;
use ndarray::{Array, Array2, ArcArray, Axis, Dimension, Ix1, Ix2, Ix4, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

mod kernels;
mod lstm;
pub use lstm::Lstm;

mod sealed {
    use super::*;

    pub trait PoolKindBase {
        fn pool(input: &Variable4, options: &Conv2Options) -> Result<Variable4>;
    }
}
use sealed::PoolKindBase;

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection and utility methods.
///
/// # Derive
/// [`Layer`] should be [derived](gradnotes_derive).
///
/// # Clone
/// Implement [`Clone`] (typically this can be derived) to make it easier to share the layer (potentially between threads).
///
/// # serde
/// Implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading the layer. This can generally be [derived](<https://serde.rs/derive.html>).
pub trait Layer: Forward + Send + Sync + 'static {
    /// The number of parameters.
    ///
    /// This is the length of [`.parameters()`](Self::parameters()).
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {}
    /// Enumerates the parameters of the layer, including child layers.
    ///
    /// Parameters are in field declaration order.
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters(&mut parameters);
        parameters
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {}
    /// Enumerates mutable references to the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Vec<&mut ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// Prepares for training or inference.
    ///
    /// When `training`, parameters create variables with nodes so that gradients are computed
    /// in the backward pass. Otherwise gradients are discarded, and layers like [`Dropout`] are
    /// disabled.
    #[allow(unused)]
    fn set_training(&mut self, training: bool) -> Result<()> {
        Ok(())
    }
    /// Updates the layer with the optimizer.
    ///
    /// Call this method on the network after the backward pass.
    fn update<O: Optimizer>(&mut self, learning_rate: f32, optimizer: &O) -> Result<()>
    where
        Self: Sized,
    {
        for parameter in self.parameters_mut() {
            optimizer.update(learning_rate, parameter.make_view_mut())?;
        }
        Ok(())
    }
}

/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
///
/// # Derive
/// [`Forward`] can be [derived](gradnotes_derive) for sequential layers (ie typical feed-foward networks).
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`](super::autograd::Variable) are expected to apply backward ops via [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed. Generally the implemenation should return an error instead of panicking.
    fn forward(&self, input: VariableD) -> Result<VariableD>;
}

fn he_normal(inputs: usize) -> impl Distribution<f32> {
    let a = (2. / inputs.max(1) as f32).sqrt();
    StandardNormal.map(move |x: f32| x * a)
}

fn sample_parameter<D, Sh>(shape: Sh, distribution: impl Distribution<f32>) -> Parameter<IxDyn>
where
    D: Dimension,
    Sh: ndarray::ShapeBuilder<Dim = D>,
{
    let mut rng = rand::thread_rng();
    let value = Array::from_shape_simple_fn(shape, || distribution.sample(&mut rng));
    Parameter::from(value.into_dyn())
}

/// Identity.
#[derive(Default, Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Identity;

impl Forward for Identity {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input)
    }
}

/// Convolutional layer.
///
/// Convolves (n, c, h, w) inputs with (outputs, c, kh, kw) filters.
#[derive(Layer, Clone, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Conv {
    #[gradnotes(parameter)]
    weight: ParameterD,
    #[gradnotes(optional_parameter)]
    bias: Option<ParameterD>,
    strides: [usize; 2],
    padding: [usize; 2],
}

impl Conv {
    /// Creates a new [`Conv`] for 'inputs`, `outputs`, and `kernel`.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: 0
    /// - bias: None
    ///
    /// The weight is initialized with a normal distribution with std_dev = sqrt(2 / (inputs * kh * kw)).
    pub fn from_inputs_outputs_kernel(inputs: usize, outputs: usize, kernel: [usize; 2]) -> Self {
        let [kh, kw] = kernel;
        let weight = sample_parameter([outputs, inputs, kh, kw], he_normal(inputs * kh * kw));
        Self {
            weight,
            bias: None,
            strides: [1, 1],
            padding: [0, 0],
        }
    }
    /// Adds strides.
    ///
    /// **Errors**
    ///
    /// The strides must be positive.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        ensure!(
            strides.iter().all(|s| *s > 0),
            "Conv strides {strides:?} must be positive!"
        );
        self.strides = strides;
        Ok(self)
    }
    /// Adds zero padding to both sides of the height and width.
    ///
    /// **Errors**
    ///
    /// The padding must be less than the kernel.
    pub fn with_padding(mut self, padding: [usize; 2]) -> Result<Self> {
        let kernel = &self.weight.shape()[2..];
        ensure!(
            padding[0] < kernel[0] && padding[1] < kernel[1],
            "Conv padding {padding:?} must be less than kernel {kernel:?}!"
        );
        self.padding = padding;
        Ok(self)
    }
    /// Adds a bias to the layer.
    ///
    /// The bias is initialized with 0`s.
    pub fn with_bias(mut self, bias: bool) -> Result<Self> {
        if bias {
            let outputs = self.weight.shape()[0];
            self.bias
                .replace(Parameter::from(Array::zeros(IxDyn(&[outputs]))));
        } else {
            self.bias = None;
        }
        Ok(self)
    }
    /// The weight.
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
}

impl Debug for Conv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Conv");
        builder.field("weight", &self.weight);
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", bias);
        }
        if self.strides != [1, 1] {
            builder.field("strides", &self.strides);
        }
        if self.padding != [0, 0] {
            builder.field("padding", &self.padding);
        }
        builder.finish()
    }
}

impl Forward for Conv {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let input = input.into_dimensionality::<Ix4>()?;
        let weight = self.weight.to_variable().into_dimensionality::<Ix4>()?;
        let bias = self
            .bias
            .as_ref()
            .map(|bias| bias.to_variable().into_dimensionality::<Ix1>())
            .transpose()?;
        let (_, _, kh, kw) = weight.dim();
        let options = Conv2Options {
            kernel: [kh, kw],
            strides: self.strides,
            padding: self.padding,
        };
        Ok(conv2d(&input, &weight, bias.as_ref(), &options)?.into_dyn())
    }
}

fn conv2d(
    input: &Variable4,
    weight: &Variable4,
    bias: Option<&Variable1>,
    options: &Conv2Options,
) -> Result<Variable4> {
    let (n, c, h, w) = input.dim();
    let (outputs, weight_inputs, kh, kw) = weight.dim();
    ensure!(
        c == weight_inputs,
        "Conv expected {weight_inputs} input channels, found {c}!"
    );
    let [oh, ow] = match options.output_shape([h, w]) {
        Some(shape) => shape,
        None => bail!(
            "Conv kernel {:?} with padding {:?} does not fit input {:?}!",
            options.kernel,
            options.padding,
            input.shape()
        ),
    };
    let patch = c * kh * kw;
    let cols = kernels::im2col(input.value().view(), options)
        .into_shape([n * oh * ow, patch])?
        .into_shared();
    let weight2 = standard_layout(weight.value().clone()).into_shape([outputs, patch])?;
    let mut output = cols.dot(&weight2.t());
    if let Some(bias) = bias {
        output += bias.value();
    }
    let value = output
        .into_shape([n, oh, ow, outputs])?
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned()
        .into_shared();
    let output_grad_rows = move |output_grad: ArcArray<f32, Ix4>| -> Result<Array2<f32>> {
        Ok(output_grad
            .permuted_axes([0, 2, 3, 1])
            .as_standard_layout()
            .into_owned()
            .into_shape([n * oh * ow, outputs])?)
    };
    let mut builder = Variable4::builder();
    if let Some(node) = input.node() {
        let weight2 = weight2.clone();
        let options = *options;
        builder.edge(node, move |output_grad| {
            let cols_grad = output_grad_rows(output_grad)?
                .dot(&weight2)
                .into_shape([n, oh * ow, patch])?;
            Ok(kernels::col2im(cols_grad.view(), [n, c, h, w], &options).into_shared())
        });
    }
    if let Some(node) = weight.node() {
        let cols = cols.clone();
        builder.edge(node, move |output_grad| {
            let weight_grad = output_grad_rows(output_grad)?.t().dot(&cols);
            Ok(weight_grad.into_shape([outputs, c, kh, kw])?.into_shared())
        });
    }
    if let Some(node) = bias.and_then(Variable::node) {
        builder.edge(node, |output_grad: ArcArray<f32, Ix4>| {
            Ok(output_grad
                .sum_axis(Axis(3))
                .sum_axis(Axis(2))
                .sum_axis(Axis(0))
                .into_shared())
        });
    }
    Ok(builder.build(value))
}

/// Dense / fully connected layer.
///
/// Applies `x W^T + b` to the last axis of the input.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Dense {
    #[gradnotes(parameter)]
    weight: ParameterD,
    #[gradnotes(optional_parameter)]
    bias: Option<ParameterD>,
}

impl Dense {
    /// Creates a new [`Dense`] for `inputs` and `outputs`.
    ///
    /// The weight is initialized with a normal distribution with std_dev = sqrt(2 / inputs).
    pub fn from_inputs_outputs(inputs: usize, outputs: usize) -> Self {
        let weight = sample_parameter([outputs, inputs], he_normal(inputs));
        Self { weight, bias: None }
    }
    /// Adds a bias to the layer.
    ///
    /// The bias is initialized with 0`s.
    pub fn with_bias(mut self, bias: bool) -> Result<Self> {
        if bias {
            let outputs = self.weight.shape()[0];
            self.bias
                .replace(Parameter::from(Array::zeros(IxDyn(&[outputs]))));
        } else {
            self.bias = None;
        }
        Ok(self)
    }
    /// The weight, (outputs, inputs).
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
}

impl Forward for Dense {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let weight = self.weight.to_variable().into_dimensionality::<Ix2>()?;
        let (outputs, inputs) = weight.dim();
        let mut shape = input.shape().to_vec();
        ensure!(
            shape.len() >= 2 && shape.last() == Some(&inputs),
            "Dense expected input [.., {inputs}], found {shape:?}!"
        );
        let rows = shape[..shape.len() - 1].iter().product::<usize>();
        let input = input.into_shape([rows, inputs])?;
        let mut output = ndarray::linalg::Dot::dot(&input, &weight.t())?;
        if let Some(bias) = self.bias.as_ref() {
            output = output.add(&bias.to_variable())?;
        }
        if let Some(last) = shape.last_mut() {
            *last = outputs;
        }
        output.into_shape(IxDyn(&shape))
    }
}

/// Flattens the input into (batch_size, features).
#[derive(Default, Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Flatten;

impl Forward for Flatten {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input.flatten()?.into_dyn())
    }
}

/// ReLU activation.
#[derive(Default, Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Relu;

impl Forward for Relu {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input.relu())
    }
}

/// Leaky ReLU activation.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct LeakyRelu {
    alpha: f32,
}

impl LeakyRelu {
    /// Creates a new [`LeakyRelu`] with slope `alpha` for negative inputs.
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl Default for LeakyRelu {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl Forward for LeakyRelu {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input.leaky_relu(self.alpha))
    }
}

/// Sigmoid activation.
#[derive(Default, Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Sigmoid;

impl Forward for Sigmoid {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input.sigmoid())
    }
}

/// Tanh activation.
#[derive(Default, Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Tanh;

impl Forward for Tanh {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input.tanh())
    }
}

/// Dropout.
///
/// While training, zeroes each element with `probability` and scales the rest by
/// `1 / (1 - probability)`. Otherwise does nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dropout {
    probability: f32,
    #[serde(skip)]
    training: bool,
}

impl Dropout {
    /// Creates a new [`Dropout`].
    ///
    /// **Errors**
    ///
    /// The `probability` must be in [0, 1).
    pub fn new(probability: f32) -> Result<Self> {
        ensure!(
            (0. ..1.).contains(&probability),
            "Dropout probability {probability} must be in [0, 1)!"
        );
        Ok(Self {
            probability,
            training: false,
        })
    }
    /// The probability of dropping an element.
    pub fn probability(&self) -> f32 {
        self.probability
    }
}

impl Layer for Dropout {
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.training = training;
        Ok(())
    }
}

impl Forward for Dropout {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        if !self.training || self.probability == 0. {
            return Ok(input);
        }
        let probability = self.probability;
        let scale = 1. / (1. - probability);
        let mut rng = rand::thread_rng();
        let mask = Array::from_shape_simple_fn(input.raw_dim(), || {
            if rng.gen::<f32>() < probability {
                0.
            } else {
                scale
            }
        });
        input.mul(&Variable::from(mask))
    }
}

/// Embedding.
///
/// Maps token ids, stored as floats, to rows of a (tokens, features) weight.
/// The output has the shape of the input with an additional features axis.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Embedding {
    #[gradnotes(parameter)]
    weight: ParameterD,
}

impl Embedding {
    /// Creates a new [`Embedding`] for `tokens` and `features`.
    ///
    /// The weight is initialized with a uniform distribution in [-0.1, 0.1).
    pub fn from_tokens_features(tokens: usize, features: usize) -> Self {
        let weight = sample_parameter([tokens, features], Uniform::new(-0.1, 0.1));
        Self { weight }
    }
    /// The weight, (tokens, features).
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
}

impl Forward for Embedding {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let weight = self.weight.to_variable().into_dimensionality::<Ix2>()?;
        let (tokens, features) = weight.dim();
        let ids = input
            .value()
            .iter()
            .map(|x| {
                let id = *x as usize;
                if x.fract() != 0. || *x < 0. || id >= tokens {
                    bail!("Embedding id {x} out of range for {tokens} tokens!");
                }
                Ok(id)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut value = Array2::zeros([ids.len(), features]);
        for (mut row, id) in value.outer_iter_mut().zip(ids.iter().copied()) {
            row.assign(&weight.value().row(id));
        }
        let mut shape = input.shape().to_vec();
        shape.push(features);
        let value = value.into_shape(IxDyn(&shape))?.into_shared();
        let mut builder = Variable::builder();
        if let Some(node) = weight.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, IxDyn>| {
                let output_grad =
                    standard_layout(output_grad).into_shape([ids.len(), features])?;
                let mut weight_grad = Array2::zeros([tokens, features]);
                for (row, id) in output_grad.outer_iter().zip(ids) {
                    let mut weight_row = weight_grad.row_mut(id);
                    weight_row += &row;
                }
                Ok(weight_grad.into_shared())
            });
        }
        Ok(builder.build(value))
    }
}

/// Marker trait for [`PoolBase`].
pub trait PoolKind: Default + Send + Sync + 'static + PoolKindBase {}

/// MaxPool kind.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct PoolMax;

impl PoolKindBase for PoolMax {
    fn pool(input: &Variable4, options: &Conv2Options) -> Result<Variable4> {
        let (n, c, h, w) = input.dim();
        let (value, indices) = kernels::max_pool2(input.value().view(), options);
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                Ok(
                    kernels::max_pool2_backward(output_grad.view(), indices.view(), [n, c, h, w])
                        .into_shared(),
                )
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

impl PoolKind for PoolMax {}

/// MeanPool kind.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct PoolMean;

impl PoolKindBase for PoolMean {
    fn pool(input: &Variable4, options: &Conv2Options) -> Result<Variable4> {
        let (n, c, h, w) = input.dim();
        let value = kernels::mean_pool2(input.value().view(), options);
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let options = *options;
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                Ok(
                    kernels::mean_pool2_backward(output_grad.view(), [n, c, h, w], &options)
                        .into_shared(),
                )
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

impl PoolKind for PoolMean {}

/// Pooling layer.
///
/// Pools (n, c, h, w) inputs over 2d windows.
#[derive(Layer, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
#[gradnotes(crate)]
pub struct PoolBase<K: PoolKind> {
    kernel: [usize; 2],
    strides: [usize; 2],
    padding: [usize; 2],
    #[serde(skip)]
    kind: K,
}

/// MaxPool.
pub type MaxPool = PoolBase<PoolMax>;

/// MeanPool.
pub type MeanPool = PoolBase<PoolMean>;

impl<K: PoolKind> PoolBase<K> {
    /// Creates a new pool with `kernel`.
    ///
    /// Defaults:
    /// - strides: kernel
    /// - padding: 0
    pub fn from_kernel(kernel: [usize; 2]) -> Self {
        Self {
            kernel,
            strides: kernel,
            padding: [0, 0],
            kind: K::default(),
        }
    }
    /// Adds strides.
    ///
    /// **Errors**
    ///
    /// The strides must be positive.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        ensure!(
            strides.iter().all(|s| *s > 0),
            "Pool strides {strides:?} must be positive!"
        );
        self.strides = strides;
        Ok(self)
    }
    /// Adds padding.
    ///
    /// **Errors**
    ///
    /// The padding must be less than the kernel.
    pub fn with_padding(mut self, padding: [usize; 2]) -> Result<Self> {
        let kernel = self.kernel;
        ensure!(
            padding[0] < kernel[0] && padding[1] < kernel[1],
            "Pool padding {padding:?} must be less than kernel {kernel:?}!"
        );
        self.padding = padding;
        Ok(self)
    }
}

impl<K: PoolKind> Debug for PoolBase<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = std::any::type_name::<K>()
            .rsplit("::")
            .next()
            .unwrap_or_default();
        f.debug_struct(name)
            .field("kernel", &self.kernel)
            .field("strides", &self.strides)
            .field("padding", &self.padding)
            .finish()
    }
}

impl<K: PoolKind> Forward for PoolBase<K> {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let input = input.into_dimensionality::<Ix4>()?;
        let options = Conv2Options {
            kernel: self.kernel,
            strides: self.strides,
            padding: self.padding,
        };
        let (_, _, h, w) = input.dim();
        if options.output_shape([h, w]).is_none() {
            bail!(
                "Pool kernel {:?} does not fit input {:?}!",
                self.kernel,
                input.shape()
            );
        }
        Ok(K::pool(&input, &options)?.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::testing::check_gradient;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array4};

    fn lenet_input() -> Array4<f32> {
        Array::from_shape_fn([2, 1, 6, 6], |(n, _, y, x)| {
            ((n * 36 + y * 6 + x) as f32 * 0.37).sin()
        })
    }

    #[test]
    fn conv_input_gradient() {
        let conv = Conv::from_inputs_outputs_kernel(1, 2, [3, 3])
            .with_padding([1, 1])
            .unwrap()
            .with_bias(true)
            .unwrap();
        check_gradient(lenet_input(), |x| {
            Ok(conv.forward(x.into_dyn())?.tanh().sum())
        });
    }

    #[test]
    fn conv_weight_and_bias_gradients() {
        let weight = Array::from_shape_fn([2, 1, 3, 3], |(o, _, y, x)| {
            ((o * 9 + y * 3 + x) as f32 * 0.71).cos() * 0.5
        });
        let options = Conv2Options {
            kernel: [3, 3],
            strides: [2, 2],
            padding: [1, 1],
        };
        check_gradient(weight.clone(), |w| {
            let x = Variable::from(lenet_input());
            Ok(conv2d(&x, &w, None, &options)?.sigmoid().sum())
        });
        check_gradient(Array1::from(vec![0.1, -0.2]), |b| {
            let x = Variable::from(lenet_input());
            let w = Variable::from(weight.clone());
            Ok(conv2d(&x, &w, Some(&b), &options)?.tanh().sum())
        });
    }

    #[test]
    fn conv_output_shape() {
        let conv = Conv::from_inputs_outputs_kernel(1, 6, [5, 5]);
        let y = conv
            .forward(Variable::from(Array::zeros([3, 1, 28, 28])).into_dyn())
            .unwrap();
        assert_eq!(y.shape(), &[3, 6, 24, 24]);
        assert!(conv
            .forward(Variable::from(Array::zeros([3, 2, 28, 28])).into_dyn())
            .is_err());
    }

    #[test]
    fn pool_gradients() {
        // distinct values, so that perturbations do not move the max
        let x = Array::from_shape_fn([2, 1, 6, 6], |(n, _, y, x)| {
            ((n * 36 + y * 6 + x) * 37 % 72) as f32 * 0.05 - 1.8
        });
        let max_pool = MaxPool::from_kernel([2, 2]);
        check_gradient(x, |x| {
            Ok(max_pool.forward(x.into_dyn())?.tanh().sum())
        });
        let mean_pool = MeanPool::from_kernel([3, 3]).with_strides([1, 1]).unwrap();
        check_gradient(lenet_input(), |x| {
            Ok(mean_pool.forward(x.into_dyn())?.sigmoid().sum())
        });
    }

    #[test]
    fn dense_applies_to_last_axis() {
        let dense = Dense::from_inputs_outputs(3, 4).with_bias(true).unwrap();
        let x = Array::from_shape_fn([2, 5, 3], |(a, b, c)| (a + b * c) as f32 * 0.1);
        let y = dense.forward(Variable::from(x.clone()).into_dyn()).unwrap();
        assert_eq!(y.shape(), &[2, 5, 4]);
        check_gradient(x, |x| Ok(dense.forward(x.into_dyn())?.tanh().sum()));
        assert!(dense
            .forward(Variable::from(Array::zeros([2, 4])).into_dyn())
            .is_err());
    }

    #[test]
    fn embedding_trains_rows() {
        let mut embedding = Embedding::from_tokens_features(4, 2);
        embedding.set_training(true).unwrap();
        let input = Variable::from(ndarray::array![[1., 1., 2.]]).into_dyn();
        let output = embedding.forward(input).unwrap();
        assert_eq!(output.shape(), &[1, 3, 2]);
        output.sum().backward().unwrap();
        let grad = embedding.weight.grad().unwrap();
        assert_eq!(
            grad.into_dimensionality::<Ix2>().unwrap(),
            ndarray::array![[0., 0.], [2., 2.], [1., 1.], [0., 0.]].into_shared()
        );
        let bad = Variable::from(ndarray::array![[4.]]).into_dyn();
        assert!(embedding.forward(bad).is_err());
    }

    #[test]
    fn dropout_training() {
        let mut dropout = Dropout::new(0.5).unwrap();
        let x = Variable::from(Array::<f32, _>::ones([100, 10])).into_dyn();
        let y = dropout.forward(x.clone()).unwrap();
        assert_eq!(y.value(), x.value());
        dropout.set_training(true).unwrap();
        let y = dropout.forward(x).unwrap();
        assert!(y.value().iter().all(|y| *y == 0. || *y == 2.));
        let kept = y.value().iter().filter(|y| **y == 2.).count();
        assert!((300..700).contains(&kept), "{kept}");
        assert!(Dropout::new(1.).is_err());
    }

    #[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
    #[gradnotes(crate)]
    struct Lenet {
        #[gradnotes(layer)]
        conv: Conv,
        #[gradnotes(layer)]
        relu: Relu,
        #[gradnotes(layer)]
        pool: MaxPool,
        #[gradnotes(layer)]
        flatten: Flatten,
        #[gradnotes(layer)]
        dropout: Dropout,
        #[gradnotes(layer)]
        dense: Dense,
    }

    fn lenet() -> Lenet {
        Lenet {
            conv: Conv::from_inputs_outputs_kernel(1, 3, [3, 3])
                .with_bias(true)
                .unwrap(),
            relu: Relu,
            pool: MaxPool::from_kernel([2, 2]),
            flatten: Flatten,
            dropout: Dropout::new(0.25).unwrap(),
            dense: Dense::from_inputs_outputs(12, 10).with_bias(true).unwrap(),
        }
    }

    #[test]
    fn derived_layer_parameters() {
        let mut model = lenet();
        assert_eq!(model.parameters_len(), 4);
        let shapes: Vec<_> = model
            .parameters()
            .iter()
            .map(|parameter| parameter.shape().to_vec())
            .collect();
        assert_eq!(
            shapes,
            vec![vec![3, 1, 3, 3], vec![3], vec![10, 12], vec![10]]
        );
        assert_eq!(model.parameters_mut().len(), 4);
        model.set_training(true).unwrap();
        assert!(model.dropout.training);
        let y = model
            .forward(Variable::from(lenet_input()).into_dyn())
            .unwrap();
        assert_eq!(y.shape(), &[2, 10]);
        y.sum().backward().unwrap();
        assert!(model.parameters().iter().all(|p| p.grad().is_some()));
        model.set_training(false).unwrap();
        assert!(!model.dropout.training);
        assert!(model.parameters().iter().all(|p| p.grad().is_none()));
    }

    #[test]
    fn layer_serde() {
        let model = lenet();
        let json = serde_json::to_string(&model).unwrap();
        let loaded: Lenet = serde_json::from_str(&json).unwrap();
        let x = Variable::from(lenet_input()).into_dyn();
        assert_relative_eq!(
            model.forward(x.clone()).unwrap().value(),
            loaded.forward(x).unwrap().value(),
            max_relative = 1e-6
        );
    }
}

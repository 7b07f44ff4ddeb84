#[cfg(doc)]
use super::autograd::Parameter;
use super::autograd::ParameterViewMut;
use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{ArrayD, ArrayViewMutD, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::any::TypeId;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`SGD`].
    #[derive(Debug)]
    pub struct SGDBuilder {
        momentum: Option<f32>,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self { momentum: None }
        }
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a "velocity" tensor will
        /// be added to the [`State`] of each [`Parameter`].
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
            }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        /// - The momentum is not in [0, 1).
        pub fn build(self) -> Result<SGD> {
            let Self { momentum } = self;
            if let Some(momentum) = momentum {
                ensure!(
                    (0. ..1.).contains(&momentum),
                    "SGD momentum {momentum} must be in [0, 1)!"
                );
            }
            Ok(SGD {
                momentum: momentum.filter(|momentum| *momentum > 0.),
            })
        }
    }

    /// Builder for creating an [`Adam`].
    #[derive(Debug)]
    pub struct AdamBuilder {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
        gradient_centralization: bool,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.,
                gradient_centralization: false,
            }
        }
        /// Decay of the first moment. Default is 0.9.
        pub fn beta1(self, beta1: f32) -> Self {
            Self { beta1, ..self }
        }
        /// Decay of the second moment. Default is 0.999.
        pub fn beta2(self, beta2: f32) -> Self {
            Self { beta2, ..self }
        }
        /// Added to the denominator. Default is 1e-8.
        pub fn epsilon(self, epsilon: f32) -> Self {
            Self { epsilon, ..self }
        }
        /// L2 penalty added to the gradient. Default is 0.
        pub fn weight_decay(self, weight_decay: f32) -> Self {
            Self {
                weight_decay,
                ..self
            }
        }
        /// Gradient centralization. Default is false.
        ///
        /// Gradients with 2 or more dimensions are centered by subtracting their mean over
        /// all axes but the first, ie per output unit / filter.
        pub fn gradient_centralization(self, gradient_centralization: bool) -> Self {
            Self {
                gradient_centralization,
                ..self
            }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        /// - The betas are not in [0, 1).
        /// - The epsilon is not positive.
        /// - The weight decay is negative.
        pub fn build(self) -> Result<Adam> {
            let Self {
                beta1,
                beta2,
                epsilon,
                weight_decay,
                gradient_centralization,
            } = self;
            for (name, beta) in [("beta1", beta1), ("beta2", beta2)] {
                ensure!(
                    (0. ..1.).contains(&beta),
                    "Adam {name} {beta} must be in [0, 1)!"
                );
            }
            ensure!(epsilon > 0., "Adam epsilon {epsilon} must be positive!");
            ensure!(
                weight_decay >= 0.,
                "Adam weight_decay {weight_decay} must not be negative!"
            );
            Ok(Adam {
                beta1,
                beta2,
                epsilon,
                weight_decay,
                gradient_centralization,
            })
        }
    }
}
use builder::*;

/// [`State`] value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// A tensor.
    Tensor(ArrayD<f32>),
    /// An elem.
    Elem(f32),
}

/// Optimizer State.
///
/// Created with [`ParameterViewMut::init_optimizer_state()`].
/// Stores per parameter training progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    name: String,
    #[serde(skip, default = "default_type_id")]
    id: TypeId,
    key_values: Vec<(String, Value)>,
}

fn default_type_id() -> TypeId {
    TypeId::of::<()>()
}

impl State {
    pub(crate) fn new(
        shape: &[usize],
        name: String,
        id: TypeId,
        key_values: Vec<(String, Value)>,
    ) -> Result<Self> {
        for (key, value) in key_values.iter() {
            if let Value::Tensor(tensor) = value {
                let value_shape = tensor.shape();
                if value_shape != shape {
                    bail!("Expected {name:?}.{key:?} shape {value_shape:?} to match parameter {shape:?}!");
                }
            }
        }
        Ok(Self {
            name,
            id,
            key_values,
        })
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Type id of the [`Optimizer`].
    ///
    /// A deserialized state has the id of `()` until the optimizer claims it by name.
    pub fn id(&self) -> TypeId {
        self.id
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    /// Iterator over keys and mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.key_values
            .iter_mut()
            .map(|(key, value)| (key.as_str(), value))
    }
    fn is<T: 'static>(&mut self, name: &str) -> bool {
        if self.id == TypeId::of::<()>() && self.name == name {
            self.id = TypeId::of::<T>();
        }
        self.id == TypeId::of::<T>()
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// Does nothing if the parameter has no gradient.
    fn update(&self, learning_rate: f32, parameter: ParameterViewMut) -> Result<()>;
}

/// Stochastic Gradient Descent.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct SGD {
    momentum: Option<f32>,
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    /// The momentum, if any.
    pub fn momentum(&self) -> Option<f32> {
        self.momentum
    }
    fn init_state(&self, parameter: &mut ParameterViewMut) -> Result<()> {
        if let (_, Some(state)) = parameter.value_view_optimizer_state_mut() {
            if state.is::<Self>("SGD") && self.momentum.is_some() == state.iter().next().is_some()
            {
                return Ok(());
            }
        }
        let mut key_values = Vec::new();
        if self.momentum.is_some() {
            let velocity = ArrayD::zeros(parameter.shape());
            key_values.push(("velocity".to_string(), Value::Tensor(velocity)));
        }
        parameter.init_optimizer_state("SGD", TypeId::of::<Self>(), key_values)
    }
}

impl Optimizer for SGD {
    fn update(&self, learning_rate: f32, mut parameter: ParameterViewMut) -> Result<()> {
        self.init_state(&mut parameter)?;
        let grad = if let Some(grad) = parameter.grad() {
            grad.clone()
        } else {
            return Ok(());
        };
        let (mut value, state) = parameter.value_view_optimizer_state_mut();
        if let Some(momentum) = self.momentum {
            let velocity = match state.and_then(|state| state.iter_mut().next()) {
                Some((_, Value::Tensor(velocity))) => velocity,
                _ => bail!("SGD expected velocity!"),
            };
            Zip::from(&mut value)
                .and(&grad)
                .and(velocity)
                .for_each(|w, dw, v| sgd_update_with_momentum(w, *dw, learning_rate, momentum, v));
        } else {
            value.scaled_add(-learning_rate, &grad);
        }
        Ok(())
    }
}

fn sgd_update_with_momentum(w: &mut f32, dw: f32, lr: f32, m: f32, v: &mut f32) {
    *v = m * *v + dw;
    *w -= lr * *v;
}

/// Adam.
///
/// Adaptive moment estimation, optionally with gradient centralization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    gradient_centralization: bool,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.,
            gradient_centralization: false,
        }
    }
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
    fn init_state(&self, parameter: &mut ParameterViewMut) -> Result<()> {
        if let (_, Some(state)) = parameter.value_view_optimizer_state_mut() {
            if state.is::<Self>("Adam") {
                return Ok(());
            }
        }
        let m = ArrayD::zeros(parameter.shape());
        let v = ArrayD::zeros(parameter.shape());
        let key_values = [
            ("m".to_string(), Value::Tensor(m)),
            ("v".to_string(), Value::Tensor(v)),
            ("t".to_string(), Value::Elem(0.)),
        ];
        parameter.init_optimizer_state("Adam", TypeId::of::<Self>(), key_values)
    }
}

impl Optimizer for Adam {
    fn update(&self, learning_rate: f32, mut parameter: ParameterViewMut) -> Result<()> {
        self.init_state(&mut parameter)?;
        let mut grad = if let Some(grad) = parameter.grad() {
            grad.to_owned()
        } else {
            return Ok(());
        };
        let (mut value, state) = parameter.value_view_optimizer_state_mut();
        let (m, v, t) = match state.map(|state| state.key_values.as_mut_slice()) {
            Some([(_, Value::Tensor(m)), (_, Value::Tensor(v)), (_, Value::Elem(t))]) => (m, v, t),
            _ => bail!("Adam expected m, v and t!"),
        };
        if self.weight_decay > 0. {
            grad.scaled_add(self.weight_decay, &value);
        }
        if self.gradient_centralization {
            centralize(grad.view_mut());
        }
        *t += 1.;
        let Self {
            beta1,
            beta2,
            epsilon,
            ..
        } = *self;
        let bias_correction1 = 1. - beta1.powf(*t);
        let bias_correction2 = 1. - beta2.powf(*t);
        Zip::from(&mut value)
            .and(&grad)
            .and(m)
            .and(v)
            .for_each(|w, dw, m, v| {
                *m = beta1 * *m + (1. - beta1) * dw;
                *v = beta2 * *v + (1. - beta2) * dw * dw;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *w -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
        Ok(())
    }
}

/// Subtracts the mean over all axes but the first.
fn centralize(mut grad: ArrayViewMutD<f32>) {
    if grad.ndim() < 2 {
        return;
    }
    for mut row in grad.axis_iter_mut(Axis(0)) {
        if let Some(mean) = row.mean() {
            row.map_inplace(|x| *x -= mean);
        }
    }
}

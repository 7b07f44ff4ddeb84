use super::{sample_parameter, Forward, Layer};
use crate::{
    learn::neural_network::autograd::{ParameterD, Variable, Variable2, VariableD},
    result::Result,
};
use anyhow::ensure;
use ndarray::{linalg::Dot, Array2, Array3, Axis, Ix2, Ix3, Slice};
use rand_distr::Uniform;
use serde::{Deserialize, Serialize};

/// Long short-term memory.
///
/// Maps (batch_size, steps, inputs) sequences to (batch_size, steps, hidden) states. The
/// initial hidden and cell states are zero.
///
/// Gates are stacked in input, forget, cell, output order along the first axis of the weights.
#[derive(Layer, Clone, Debug, Serialize, Deserialize)]
#[gradnotes(crate)]
pub struct Lstm {
    #[gradnotes(parameter)]
    weight_input: ParameterD,
    #[gradnotes(parameter)]
    weight_hidden: ParameterD,
    #[gradnotes(parameter)]
    bias: ParameterD,
}

impl Lstm {
    /// Creates a new [`Lstm`] for `inputs` and `hidden` units.
    ///
    /// Weights are initialized with a uniform distribution in [-1 / sqrt(hidden), 1 / sqrt(hidden)).
    /// The bias is 0, except for the forget gate which is 1.
    pub fn from_inputs_hidden(inputs: usize, hidden: usize) -> Self {
        let k = 1. / (hidden.max(1) as f32).sqrt();
        let weight_input = sample_parameter([4 * hidden, inputs], Uniform::new(-k, k));
        let weight_hidden = sample_parameter([4 * hidden, hidden], Uniform::new(-k, k));
        let mut bias = ndarray::Array1::<f32>::zeros(4 * hidden);
        bias.slice_axis_mut(Axis(0), Slice::from(hidden..2 * hidden))
            .fill(1.);
        Self {
            weight_input,
            weight_hidden,
            bias: bias.into_dyn().into(),
        }
    }
    /// The number of inputs.
    pub fn inputs(&self) -> usize {
        self.weight_input.shape()[1]
    }
    /// The number of hidden units.
    pub fn hidden(&self) -> usize {
        self.weight_hidden.shape()[1]
    }
}

impl Forward for Lstm {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let input = input.into_dimensionality::<Ix3>()?;
        let (batch_size, steps, inputs) = input.dim();
        let hidden = self.hidden();
        ensure!(
            inputs == self.inputs(),
            "Lstm expected {} inputs, found {inputs}!",
            self.inputs()
        );
        if steps == 0 {
            return Ok(Variable::from(Array3::zeros([batch_size, 0, hidden])).into_dyn());
        }
        let weight_input = self
            .weight_input
            .to_variable()
            .into_dimensionality::<Ix2>()?
            .reversed_axes();
        let weight_hidden = self
            .weight_hidden
            .to_variable()
            .into_dimensionality::<Ix2>()?
            .reversed_axes();
        let bias = self.bias.to_variable();
        let mut state = Variable2::from(Array2::zeros([batch_size, hidden]));
        let mut cell = Variable2::from(Array2::zeros([batch_size, hidden]));
        let mut outputs = Vec::with_capacity(steps);
        for step in 0..steps {
            let x = input
                .narrow(Axis(1), step, 1)?
                .into_shape([batch_size, inputs])?;
            let gates = x
                .dot(&weight_input)?
                .add(&state.dot(&weight_hidden)?)?
                .add(&bias)?;
            let gate = |i: usize| gates.narrow(Axis(1), i * hidden, hidden);
            let input_gate = gate(0)?.sigmoid();
            let forget_gate = gate(1)?.sigmoid();
            let cell_gate = gate(2)?.tanh();
            let output_gate = gate(3)?.sigmoid();
            cell = forget_gate
                .mul(&cell)?
                .add(&input_gate.mul(&cell_gate)?)?;
            state = output_gate.mul(&cell.tanh())?;
            outputs.push(state.clone());
        }
        Ok(Variable::stack(Axis(1), &outputs)?.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::testing::check_gradient;
    use ndarray::Array;

    fn sequence() -> Array3<f32> {
        Array::from_shape_fn([2, 3, 2], |(n, t, d)| ((n * 6 + t * 2 + d) as f32 * 0.9).sin())
    }

    #[test]
    fn lstm_output_shape() {
        let lstm = Lstm::from_inputs_hidden(2, 4);
        assert_eq!(lstm.parameters_len(), 3);
        let y = lstm.forward(Variable::from(sequence()).into_dyn()).unwrap();
        assert_eq!(y.shape(), &[2, 3, 4]);
        assert!(y.value().iter().all(|y| y.abs() < 1.));
        let empty = Variable::from(Array3::zeros([2, 0, 2])).into_dyn();
        assert_eq!(lstm.forward(empty).unwrap().shape(), &[2, 0, 4]);
        let wrong = Variable::from(Array3::zeros([2, 3, 5])).into_dyn();
        assert!(lstm.forward(wrong).is_err());
    }

    #[test]
    fn lstm_input_gradient() {
        let lstm = Lstm::from_inputs_hidden(2, 3);
        check_gradient(sequence(), |x| {
            let y = lstm.forward(x.into_dyn())?;
            let w = Variable::from(Array::linspace(-1., 1., y.value().len()))
                .into_shape(y.raw_dim())?;
            Ok(y.mul(&w)?.sum())
        });
    }

    #[test]
    fn lstm_parameter_gradients() {
        let mut lstm = Lstm::from_inputs_hidden(2, 3);
        lstm.set_training(true).unwrap();
        let y = lstm.forward(Variable::from(sequence()).into_dyn()).unwrap();
        y.sum().backward().unwrap();
        for parameter in lstm.parameters() {
            let grad = parameter.grad().unwrap();
            assert_eq!(grad.shape(), parameter.shape());
            assert!(grad.iter().any(|dx| *dx != 0.));
        }
    }
}

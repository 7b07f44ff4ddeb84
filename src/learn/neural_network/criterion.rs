use super::autograd::{sigmoid, Variable, Variable0, VariableD};
use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{arr0, ArcArray, Array2, ArrayBase, ArrayView2, Data, Dimension, Ix0, Zip};
use serde::{Deserialize, Serialize};

/// A loss function.
///
/// Criterions compute a scalar loss from the output of a network and the target. The loss is
/// the mean over the batch, so that the learning rate does not depend on the batch size.
pub trait Criterion<X, T: ?Sized> {
    /// Evaluates the loss.
    ///
    /// **Errors**
    ///
    /// The shapes of `input` and `target` are incompatible.
    fn eval(&self, input: X, target: &T) -> Result<Variable0>;
    /// The number of correct predictions and the number of predictions, for classifiers.
    #[allow(unused)]
    fn correct(&self, input: &X, target: &T) -> Result<Option<(usize, usize)>> {
        Ok(None)
    }
}

/// Softmax over the last axis.
pub fn softmax(input: ArrayView2<f32>) -> Array2<f32> {
    let mut output = input.to_owned();
    for mut row in output.outer_iter_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.map_inplace(|x| *x = (*x - max).exp());
        let sum = row.sum();
        row.map_inplace(|x| *x /= sum);
    }
    output
}

/// `ln(sum(exp(x)))`, shifted by the max for stability. NaN in propagates to the output.
fn log_sum_exp<'a>(row: impl IntoIterator<Item = &'a f32> + Clone) -> f32 {
    let max = row.clone().into_iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.into_iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

fn argmax<'a>(row: impl IntoIterator<Item = &'a f32>) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, x) in row.into_iter().copied().enumerate() {
        if x > best.1 {
            best = (i, x);
        }
    }
    best.0
}

/// Cross entropy loss of logits with class indices.
///
/// The input logits have shape (.., classes), and the target classes have the shape of the input
/// without the last axis. Targets equal to the ignored class, for example padding, do not
/// contribute to the loss or accuracy.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct CrossEntropyLoss {
    ignore_class: Option<usize>,
}

impl CrossEntropyLoss {
    /// Ignores targets equal to `class`.
    pub fn with_ignore_class(self, class: usize) -> Self {
        Self {
            ignore_class: Some(class),
        }
    }
    fn rows_classes(&self, input: &[usize], target: &[usize]) -> Result<(usize, usize)> {
        match input.split_last() {
            Some((classes, batch)) if batch == target => Ok((batch.iter().product(), *classes)),
            _ => bail!(
                "CrossEntropyLoss expected input shape (.., classes) and target shape (..), found {input:?} and {target:?}!"
            ),
        }
    }
    fn counted(&self, class: usize) -> bool {
        self.ignore_class != Some(class)
    }
}

impl<S, D> Criterion<VariableD, ArrayBase<S, D>> for CrossEntropyLoss
where
    S: Data<Elem = usize>,
    D: Dimension,
{
    fn eval(&self, input: VariableD, target: &ArrayBase<S, D>) -> Result<Variable0> {
        let (rows, classes) = self.rows_classes(input.shape(), target.shape())?;
        let input = input.into_shape([rows, classes])?;
        let target: Vec<usize> = target.iter().copied().collect();
        if let Some(class) = target
            .iter()
            .find(|class| self.counted(**class) && **class >= classes)
        {
            bail!("CrossEntropyLoss target {class} out of range for {classes} classes!");
        }
        let logits = input.value();
        let mut loss = 0f32;
        let mut count = 0usize;
        for (x, class) in logits.outer_iter().zip(target.iter().copied()) {
            if self.counted(class) {
                loss += log_sum_exp(&x) - x[class];
                count += 1;
            }
        }
        let probabilities = softmax(logits.view());
        let scale = if count > 0 { 1. / count as f32 } else { 0. };
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let ignore_class = self.ignore_class;
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = output_grad[()] * scale;
                let mut input_grad = probabilities;
                for (mut dx, class) in input_grad.outer_iter_mut().zip(target) {
                    if ignore_class == Some(class) {
                        dx.fill(0.);
                    } else {
                        dx[class] -= 1.;
                        dx.map_inplace(|dx| *dx *= dy);
                    }
                }
                Ok(input_grad.into_shared())
            });
        }
        Ok(builder.build(arr0(loss * scale).into_shared()))
    }
    fn correct(
        &self,
        input: &VariableD,
        target: &ArrayBase<S, D>,
    ) -> Result<Option<(usize, usize)>> {
        let (rows, classes) = self.rows_classes(input.shape(), target.shape())?;
        let input = input
            .value()
            .as_standard_layout()
            .into_owned()
            .into_shape([rows, classes])?;
        let mut correct = 0;
        let mut total = 0;
        for (row, class) in input.outer_iter().zip(target.iter().copied()) {
            if self.counted(class) {
                total += 1;
                if argmax(&row) == class {
                    correct += 1;
                }
            }
        }
        Ok(Some((correct, total)))
    }
}

fn ensure_same_shape(name: &str, input: &[usize], target: &[usize]) -> Result<()> {
    ensure!(
        input == target,
        "{name} expected target shape {input:?}, found {target:?}!"
    );
    Ok(())
}

/// Mean squared error loss.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct MseLoss;

impl<S, D> Criterion<VariableD, ArrayBase<S, D>> for MseLoss
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    fn eval(&self, input: VariableD, target: &ArrayBase<S, D>) -> Result<Variable0> {
        ensure_same_shape("MseLoss", input.shape(), target.shape())?;
        let target = target.view().into_dyn();
        let mut diff = input.value().to_owned();
        Zip::from(&mut diff).and(&target).for_each(|x, t| *x -= t);
        let scale = 1. / diff.len().max(1) as f32;
        let loss = diff.iter().map(|d| d * d).sum::<f32>() * scale;
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = 2. * scale * output_grad[()];
                Ok(diff.mapv(|d| dy * d).into_shared())
            });
        }
        Ok(builder.build(arr0(loss).into_shared()))
    }
}

/// Binary cross entropy of logits with targets in [0, 1].
///
/// Combines a sigmoid with the loss for numerical stability.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct BceWithLogitsLoss;

impl<S, D> Criterion<VariableD, ArrayBase<S, D>> for BceWithLogitsLoss
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    fn eval(&self, input: VariableD, target: &ArrayBase<S, D>) -> Result<Variable0> {
        ensure_same_shape("BceWithLogitsLoss", input.shape(), target.shape())?;
        let target = target.view().into_dyn();
        let scale = 1. / input.value().len().max(1) as f32;
        let mut loss = 0.;
        Zip::from(input.value()).and(&target).for_each(|x, t| {
            loss += x.max(0.) - x * t + (-x.abs()).exp().ln_1p();
        });
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let mut input_grad = input.value().to_owned();
            Zip::from(&mut input_grad)
                .and(&target)
                .for_each(|x, t| *x = sigmoid(*x) - t);
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                let dy = scale * output_grad[()];
                input_grad.map_inplace(|dx| *dx *= dy);
                Ok(input_grad.into_shared())
            });
        }
        Ok(builder.build(arr0(loss * scale).into_shared()))
    }
    fn correct(
        &self,
        input: &VariableD,
        target: &ArrayBase<S, D>,
    ) -> Result<Option<(usize, usize)>> {
        ensure_same_shape("BceWithLogitsLoss", input.shape(), target.shape())?;
        let target = target.view().into_dyn();
        let mut correct = 0;
        Zip::from(input.value()).and(&target).for_each(|x, t| {
            if (*x > 0.) == (*t > 0.5) {
                correct += 1;
            }
        });
        Ok(Some((correct, input.value().len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::testing::check_gradient;
    use approx::assert_relative_eq;
    use ndarray::{array, Array};

    fn logits() -> ndarray::Array2<f32> {
        array![[1., 2., 0.5], [0.1, -0.3, 2.2], [0.3, 0.3, -1.]]
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let p = softmax(logits().view());
        for row in p.outer_iter() {
            assert_relative_eq!(row.sum(), 1., max_relative = 1e-6);
        }
        assert_eq!(argmax(&p.row(0)), 1);
    }

    #[test]
    fn cross_entropy_uniform() {
        let input = Variable::from(Array::<f32, _>::zeros([4, 10])).into_dyn();
        let loss = CrossEntropyLoss::default()
            .eval(input, &array![0usize, 3, 9, 2])
            .unwrap();
        assert_relative_eq!(loss.scalar(), 10f32.ln(), max_relative = 1e-6);
    }

    #[test]
    fn cross_entropy_non_finite_logits() {
        let criterion = CrossEntropyLoss::default();
        let large = Variable::from(array![[1000., 0.], [0., -1000.]]).into_dyn();
        let loss = criterion.eval(large, &array![0usize, 0]).unwrap();
        assert_relative_eq!(loss.scalar(), 0., epsilon = 1e-6);
        for x in [f32::NAN, f32::INFINITY] {
            let input = Variable::from(array![[x, 0.], [0., 1.]]).into_dyn();
            let loss = criterion.eval(input, &array![1usize, 0]).unwrap();
            assert!(!loss.scalar().is_finite(), "{x}");
        }
    }

    #[test]
    fn cross_entropy_gradient() {
        let target = array![1usize, 2, 0];
        check_gradient(logits().into_dyn(), |x| {
            CrossEntropyLoss::default().eval(x, &target)
        });
        let criterion = CrossEntropyLoss::default().with_ignore_class(0);
        check_gradient(logits().into_dyn(), |x| criterion.eval(x, &target));
    }

    #[test]
    fn cross_entropy_sequences_ignore_padding() {
        let input = Variable::from(
            Array::from_shape_fn([2, 3, 4], |(n, t, c)| if c == n + t { 5. } else { 0. })
                .into_dyn(),
        );
        let target = array![[0usize, 1, 2], [1, 2, 0]];
        let criterion = CrossEntropyLoss::default().with_ignore_class(0);
        let (correct, total) = criterion.correct(&input, &target).unwrap().unwrap();
        assert_eq!((correct, total), (4, 4));
        let loss = criterion.eval(input.clone(), &target).unwrap().scalar();
        let all = CrossEntropyLoss::default()
            .eval(input, &target)
            .unwrap()
            .scalar();
        // one padded position is mispredicted
        assert!(loss < all);
        assert!(criterion.eval(Variable::from(Array::zeros([2, 3])).into_dyn(), &target).is_err());
        assert!(CrossEntropyLoss::default()
            .eval(Variable::from(Array::zeros([1, 2])).into_dyn(), &array![2usize])
            .is_err());
    }

    #[test]
    fn mse() {
        let input = Variable::from(array![[1., 2.], [3., 4.]]).into_dyn();
        let loss = MseLoss.eval(input, &array![[1., 1.], [1., 1.]]).unwrap();
        assert_relative_eq!(loss.scalar(), (0. + 1. + 4. + 9.) / 4.);
        let target = array![[0.5, -0.5], [0.25, 1.]];
        check_gradient(array![[0.1, 0.2], [-1., 3.]].into_dyn(), |x| {
            MseLoss.eval(x, &target)
        });
    }

    #[test]
    fn bce_with_logits() {
        let input = Variable::from(Array::<f32, _>::zeros([2, 2])).into_dyn();
        let target = array![[0., 1.], [1., 0.]];
        let loss = BceWithLogitsLoss.eval(input, &target).unwrap();
        assert_relative_eq!(loss.scalar(), 2f32.ln(), max_relative = 1e-6);
        let target = array![[1., 0., 1.], [0., 0., 1.], [1., 1., 0.]];
        check_gradient(logits().into_dyn(), |x| BceWithLogitsLoss.eval(x, &target));
        let input = Variable::from(logits()).into_dyn();
        let (correct, total) = BceWithLogitsLoss
            .correct(&input, &target)
            .unwrap()
            .unwrap();
        assert_eq!(total, 9);
        assert_eq!(correct, 7);
    }
}

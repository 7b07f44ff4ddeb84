/*!
# Example
A [LeNet-5](<http://yann.lecun.com/exdb/lenet/>) network might look like this:
```
use gradnotes::learn::neural_network::layer::{Conv, Dense, Flatten, Forward, Layer, MaxPool, Relu};

#[derive(Layer, Forward)]
struct Lenet5 {
    #[gradnotes(layer)]
    conv1: Conv,
    #[gradnotes(layer)]
    relu1: Relu,
    #[gradnotes(layer)]
    pool1: MaxPool,
    #[gradnotes(layer)]
    conv2: Conv,
    #[gradnotes(layer)]
    relu2: Relu,
    #[gradnotes(layer)]
    pool2: MaxPool,
    #[gradnotes(layer)]
    flatten: Flatten,
    #[gradnotes(layer)]
    dense1: Dense,
    #[gradnotes(layer)]
    relu3: Relu,
    #[gradnotes(layer)]
    dense2: Dense,
    #[gradnotes(layer)]
    relu4: Relu,
    #[gradnotes(layer)]
    dense3: Dense,
}
```

# Training
Each batch runs as:
1. `set_training(true)`, so that parameters create variables with nodes.
2. The forward pass and the loss. A loss that is not finite is an error, before any update.
3. `loss.backward()`, computing the gradients of the parameters.
4. An [`Optimizer`](optimizer::Optimizer) update of each parameter.
5. `set_training(false)`, discarding the gradients, also when a step fails.

[`NetworkTrainer`] implements this loop for supervised learning.
*/
use super::{Infer, Stats, Summarize, Summary, Test, Train};
use crate::result::Result;
use autograd::{Variable, VariableD};
use criterion::{Criterion, CrossEntropyLoss};
use layer::{Forward, Layer};
use ndarray::{ArrayBase, ArrayD, Data, Dimension};
use optimizer::{Optimizer, SGD};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    ops::{Deref, DerefMut},
    path::Path,
};

/// Variables and Parameters.
pub mod autograd;
/// Loss functions.
pub mod criterion;
/// Layers.
pub mod layer;
/// Optimizers.
pub mod optimizer;

/// A neural network.
///
/// Provides an [`Infer`] implementation for [`Layer`]'s.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Network<L>(pub L);

impl<L> From<L> for Network<L> {
    fn from(layer: L) -> Self {
        Self(layer)
    }
}

impl<L> Network<L> {
    /// Unwraps the layer.
    pub fn into_inner(self) -> L {
        self.0
    }
}

impl<L> Deref for Network<L> {
    type Target = L;
    fn deref(&self) -> &L {
        &self.0
    }
}

impl<L> DerefMut for Network<L> {
    fn deref_mut(&mut self) -> &mut L {
        &mut self.0
    }
}

impl<L: Layer, S: Data<Elem = f32>, D: Dimension> Infer<&ArrayBase<S, D>> for Network<L> {
    type Output = ArrayD<f32>;
    fn infer(&self, input: &ArrayBase<S, D>) -> Result<ArrayD<f32>> {
        let input = Variable::from(input.to_owned().into_dyn());
        Ok(self.0.forward(input)?.into_value().into_owned())
    }
}

/// A neural network trainer.
///
/// Trains a [`Network`] with a [`Criterion`] and an [`Optimizer`] at a constant learning rate.
#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkTrainer<L, C = CrossEntropyLoss, O = SGD> {
    network: Network<L>,
    criterion: C,
    optimizer: O,
    learning_rate: f32,
    summary: Summary,
}

impl<L: Layer> NetworkTrainer<L> {
    /// Creates a trainer from a network.
    ///
    /// Defaults to [`CrossEntropyLoss`] and [`SGD`] with a learning rate of 0.01.
    pub fn from_network(network: Network<L>) -> Self {
        Self {
            network,
            criterion: CrossEntropyLoss::default(),
            optimizer: SGD::default(),
            learning_rate: 0.01,
            summary: Summary::default(),
        }
    }
}

impl<L: Layer> From<Network<L>> for NetworkTrainer<L> {
    fn from(network: Network<L>) -> Self {
        Self::from_network(network)
    }
}

impl<L, C, O> NetworkTrainer<L, C, O> {
    /// Sets the criterion.
    pub fn with_criterion<C2>(self, criterion: C2) -> NetworkTrainer<L, C2, O> {
        NetworkTrainer {
            network: self.network,
            criterion,
            optimizer: self.optimizer,
            learning_rate: self.learning_rate,
            summary: self.summary,
        }
    }
    /// Sets the optimizer.
    pub fn with_optimizer<O2>(self, optimizer: O2) -> NetworkTrainer<L, C, O2> {
        NetworkTrainer {
            network: self.network,
            criterion: self.criterion,
            optimizer,
            learning_rate: self.learning_rate,
            summary: self.summary,
        }
    }
    /// Sets the learning rate.
    ///
    /// **Errors**
    /// The learning rate is not positive and finite.
    pub fn with_learning_rate(self, learning_rate: f32) -> Result<Self> {
        anyhow::ensure!(
            learning_rate > 0. && learning_rate.is_finite(),
            "learning_rate must be positive, found {learning_rate}!"
        );
        Ok(Self {
            learning_rate,
            ..self
        })
    }
    /// The learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
    /// The network.
    pub fn network(&self) -> &Network<L> {
        &self.network
    }
    /// Unwraps the network.
    pub fn into_network(self) -> Network<L> {
        self.network
    }
    /// Saves the trainer, including the parameters, optimizer state and summary, as json.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()>
    where
        Self: Serialize,
    {
        let path = path.as_ref();
        serde_json::to_writer(BufWriter::new(File::create(path)?), self)?;
        log::info!("saved trainer to {path:?}");
        Ok(())
    }
    /// Loads a trainer saved with [`.save_json()`](Self::save_json).
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self>
    where
        Self: DeserializeOwned,
    {
        let path = path.as_ref();
        let trainer = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        log::info!("loaded trainer from {path:?}");
        Ok(trainer)
    }
}

impl<L, C, O> Summarize for NetworkTrainer<L, C, O> {
    fn summarize(&self) -> Summary {
        self.summary.clone()
    }
}

impl<L, C, O> Deref for NetworkTrainer<L, C, O> {
    type Target = Network<L>;
    fn deref(&self) -> &Self::Target {
        &self.network
    }
}

fn batch_size(shape: &[usize]) -> usize {
    shape.first().copied().unwrap_or(1)
}

fn test<L, C, S, D, T, I>(network: &Network<L>, criterion: &C, test_iter: I) -> Result<Stats>
where
    L: Layer,
    C: Criterion<VariableD, T>,
    S: Data<Elem = f32>,
    D: Dimension,
    I: IntoIterator<Item = (ArrayBase<S, D>, T)>,
{
    let mut stats = Stats::default();
    for (x, t) in test_iter {
        let count = batch_size(x.shape());
        let y = network.forward(Variable::from(x.into_owned().into_dyn()))?;
        let correct = criterion.correct(&y, &t)?;
        let loss = criterion.eval(y, &t)?.scalar();
        stats.add_batch(count, loss, correct);
    }
    Ok(stats)
}

fn train<L, C, O, S, D, T, I>(
    network: &mut Network<L>,
    criterion: &C,
    optimizer: &O,
    learning_rate: f32,
    train_iter: I,
) -> Result<Stats>
where
    L: Layer,
    C: Criterion<VariableD, T>,
    O: Optimizer,
    S: Data<Elem = f32>,
    D: Dimension,
    I: IntoIterator<Item = (ArrayBase<S, D>, T)>,
{
    let mut stats = Stats::default();
    for (batch, (x, t)) in train_iter.into_iter().enumerate() {
        let count = batch_size(x.shape());
        network.set_training(true)?;
        let result = train_batch(network, criterion, optimizer, learning_rate, x, &t, batch);
        // gradients are discarded on errors too
        network.set_training(false)?;
        let (loss, correct) = result?;
        log::debug!("batch {batch}: count {count} loss {loss}");
        stats.add_batch(count, loss, correct);
    }
    Ok(stats)
}

/// Returns the loss and the correct predictions. Non finite losses are an error, and do not
/// update the network.
fn train_batch<L, C, O, S, D, T>(
    network: &mut Network<L>,
    criterion: &C,
    optimizer: &O,
    learning_rate: f32,
    x: ArrayBase<S, D>,
    t: &T,
    batch: usize,
) -> Result<(f32, Option<(usize, usize)>)>
where
    L: Layer,
    C: Criterion<VariableD, T>,
    O: Optimizer,
    S: Data<Elem = f32>,
    D: Dimension,
{
    let y = network.forward(Variable::from(x.into_owned().into_dyn()))?;
    let correct = criterion.correct(&y, t)?;
    let loss = criterion.eval(y, t)?;
    let value = loss.scalar();
    anyhow::ensure!(value.is_finite(), "loss diverged at batch {batch}: {value}!");
    loss.backward()?;
    network.update(learning_rate, optimizer)?;
    Ok((value, correct))
}

impl<L, C, O, S, D, T> Train<(ArrayBase<S, D>, T)> for NetworkTrainer<L, C, O>
where
    L: Layer,
    C: Criterion<VariableD, T>,
    O: Optimizer,
    S: Data<Elem = f32>,
    D: Dimension,
{
    fn train_test<I1, I2>(&mut self, train_iter: I1, test_iter: I2) -> Result<(Stats, Stats)>
    where
        I1: IntoIterator<Item = (ArrayBase<S, D>, T)>,
        I2: IntoIterator<Item = (ArrayBase<S, D>, T)>,
    {
        let Self {
            network,
            criterion,
            optimizer,
            learning_rate,
            summary,
        } = self;
        let mut train_iter = Some(train_iter);
        let mut test_iter = Some(test_iter);
        summary.run_epoch(|_| {
            let train_stats = match train_iter.take() {
                Some(iter) => train(network, criterion, optimizer, *learning_rate, iter)?,
                None => Stats::default(),
            };
            let test_stats = match test_iter.take() {
                Some(iter) => test(network, criterion, iter)?,
                None => Stats::default(),
            };
            Ok((train_stats, test_stats))
        })?;
        log::info!("{summary}");
        Ok((*summary.train(), *summary.test()))
    }
}

impl<L, C, O, S, D, T> Test<(ArrayBase<S, D>, T)> for NetworkTrainer<L, C, O>
where
    L: Layer,
    C: Criterion<VariableD, T>,
    S: Data<Elem = f32>,
    D: Dimension,
{
    fn test<I>(&self, test_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = (ArrayBase<S, D>, T)>,
    {
        test(&self.network, &self.criterion, test_iter)
    }
}

#[cfg(test)]
mod tests {
    use super::{layer::Dense, optimizer::Adam, *};
    use ndarray::{Array1, Array2};

    #[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
    #[gradnotes(crate)]
    struct Linear {
        #[gradnotes(layer)]
        dense: Dense,
    }

    fn blobs() -> (Array2<f32>, Array1<usize>) {
        let x = Array2::from_shape_fn([40, 2], |(i, j)| {
            let class = i % 2;
            let offset = if class == 0 { -1. } else { 1. };
            offset + 0.1 * ((i * 7 + j * 3) as f32).sin()
        });
        let t = Array1::from_shape_fn(40, |i| i % 2);
        (x, t)
    }

    fn linear() -> Network<Linear> {
        Network(Linear {
            dense: Dense::from_inputs_outputs(2, 2).with_bias(true).unwrap(),
        })
    }

    #[test]
    fn trainer_reduces_loss() {
        let (x, t) = blobs();
        let mut trainer = NetworkTrainer::from_network(linear())
            .with_optimizer(Adam::default())
            .with_learning_rate(0.1)
            .unwrap();
        let before = trainer.test([(x.view(), t.view())]).unwrap();
        for _ in 0..50 {
            trainer
                .train_test([(x.view(), t.view())], [(x.view(), t.view())])
                .unwrap();
        }
        let summary = trainer.summarize();
        assert_eq!(summary.epoch(), 50);
        assert!(summary.test().loss().unwrap() < before.loss().unwrap());
        assert_eq!(summary.test().accuracy(), Some(1.));
        for parameter in trainer.parameters() {
            assert!(parameter.grad().is_none());
        }
    }

    #[test]
    fn trainer_rejects_non_finite_loss() {
        let (mut x, t) = blobs();
        x[[3, 1]] = f32::INFINITY;
        let mut trainer = NetworkTrainer::from_network(linear())
            .with_optimizer(Adam::default())
            .with_learning_rate(0.1)
            .unwrap();
        let before: Vec<_> = trainer
            .parameters()
            .iter()
            .map(|parameter| parameter.value().clone())
            .collect();
        let error = trainer.train([(x.view(), t.view())]).unwrap_err();
        assert!(error.to_string().contains("loss diverged"), "{error}");
        for (before, after) in before.iter().zip(trainer.parameters()) {
            assert_eq!(before, after.value());
            assert!(after.value().iter().all(|x| x.is_finite()));
            assert!(after.grad().is_none());
            assert!(after.optimizer_state().is_none());
        }
    }

    #[test]
    fn trainer_save_load() {
        let (x, t) = blobs();
        let mut trainer = NetworkTrainer::from_network(linear())
            .with_optimizer(Adam::default());
        trainer.train([(x.view(), t.view())]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trainer.json");
        trainer.save_json(&path).unwrap();
        let loaded =
            NetworkTrainer::<Linear, CrossEntropyLoss, Adam>::load_json(&path).unwrap();
        assert_eq!(loaded.summarize().epoch(), 1);
        let y = trainer.infer(&x).unwrap();
        let y_loaded = loaded.infer(&x).unwrap();
        approx::assert_relative_eq!(y, y_loaded, max_relative = 1e-6);
        let state = loaded.parameters()[0].optimizer_state().cloned();
        assert!(state.is_some());
        assert!(trainer.with_learning_rate(-1.).is_err());
    }
}

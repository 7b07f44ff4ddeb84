/*!
Adversarial training of a generator against a discriminator.

Each [`step`](GanTrainer::step) alternates:
1. A discriminator update on real samples labeled 1 and generated samples labeled 0. The
generated samples are computed without a graph, so the generator is not updated.
2. A generator update with the non-saturating loss, ie generated samples labeled 1. The
discriminator is not training, so it only passes gradients through to its input.

Both networks use plain gradient descent with constant, independent learning rates.
*/
use super::neural_network::{
    autograd::{sigmoid, Variable, Variable0, VariableD},
    criterion::{BceWithLogitsLoss, Criterion},
    layer::{Forward, Layer},
    optimizer::SGD,
    Network,
};
use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array2, ArrayBase, ArrayD, Data, Dimension};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Statistics of a [`GanTrainer::step`].
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GanStats {
    /// The discriminator loss, summed over real and generated samples.
    pub discriminator_loss: f32,
    /// The generator loss.
    pub generator_loss: f32,
    /// The mean probability the discriminator assigns to real samples being real.
    pub real_score: f32,
    /// The mean probability the discriminator assigns to generated samples being real.
    pub fake_score: f32,
}

impl Display for GanStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "d_loss: {:.4} g_loss: {:.4} D(x): {:.3} D(G(z)): {:.3}",
            self.discriminator_loss, self.generator_loss, self.real_score, self.fake_score
        )
    }
}

/// Trains a generator `G` and a discriminator `D`.
///
/// The generator maps (batch_size, latent) noise to samples shaped like the real data, and the
/// discriminator maps samples to (batch_size, 1) logits.
#[derive(Debug)]
pub struct GanTrainer<G, D> {
    generator: Network<G>,
    discriminator: Network<D>,
    latent: usize,
    generator_learning_rate: f32,
    discriminator_learning_rate: f32,
    optimizer: SGD,
    rng: StdRng,
    steps: usize,
}

impl<G: Layer, D: Layer> GanTrainer<G, D> {
    /// Creates a trainer with `latent` noise features.
    ///
    /// The learning rates default to 0.01, and the latent noise is seeded from entropy.
    pub fn new(generator: G, discriminator: D, latent: usize) -> Self {
        Self {
            generator: Network(generator),
            discriminator: Network(discriminator),
            latent,
            generator_learning_rate: 0.01,
            discriminator_learning_rate: 0.01,
            optimizer: SGD::default(),
            rng: StdRng::from_entropy(),
            steps: 0,
        }
    }
    /// Sets the learning rates of the generator and discriminator.
    ///
    /// **Errors**
    /// The learning rates are not positive and finite.
    pub fn with_learning_rates(self, generator: f32, discriminator: f32) -> Result<Self> {
        for learning_rate in [generator, discriminator] {
            ensure!(
                learning_rate > 0. && learning_rate.is_finite(),
                "learning rate must be positive, found {learning_rate}!"
            );
        }
        Ok(Self {
            generator_learning_rate: generator,
            discriminator_learning_rate: discriminator,
            ..self
        })
    }
    /// Seeds the latent noise.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..self
        }
    }
    /// The generator.
    pub fn generator(&self) -> &Network<G> {
        &self.generator
    }
    /// The discriminator.
    pub fn discriminator(&self) -> &Network<D> {
        &self.discriminator
    }
    /// The number of completed steps.
    pub fn steps(&self) -> usize {
        self.steps
    }
    fn sample_latent(&mut self, batch_size: usize) -> Array2<f32> {
        let rng = &mut self.rng;
        Array2::from_shape_simple_fn([batch_size, self.latent], || StandardNormal.sample(rng))
    }
    /// Generates `batch_size` samples.
    pub fn sample(&mut self, batch_size: usize) -> Result<ArrayD<f32>> {
        let z = Variable::from(self.sample_latent(batch_size).into_dyn());
        Ok(self.generator.forward(z)?.into_value().into_owned())
    }
    /// Performs a discriminator update and a generator update with a batch of real samples.
    ///
    /// **Errors**
    /// The real samples are empty, or the shapes of the real samples, generated samples and
    /// logits are not compatible.
    pub fn step<S, E>(&mut self, real: &ArrayBase<S, E>) -> Result<GanStats>
    where
        S: Data<Elem = f32>,
        E: Dimension,
    {
        let batch_size = real.shape().first().copied().unwrap_or(0);
        ensure!(batch_size > 0, "GanTrainer::step expected a non empty batch!");
        let fake = self.sample(batch_size)?;
        ensure!(
            fake.shape() == real.shape(),
            "generated shape {:?} != real shape {:?}!",
            fake.shape(),
            real.shape()
        );
        let real = Variable::from(real.to_owned().into_dyn());
        let (discriminator_loss, real_score, fake_score) =
            self.discriminator_step(real, Variable::from(fake))?;
        let generator_loss = self.generator_step(batch_size)?;

        self.steps += 1;
        let stats = GanStats {
            discriminator_loss,
            generator_loss,
            real_score,
            fake_score,
        };
        log::debug!("step {}: {stats}", self.steps);
        Ok(stats)
    }
}

impl<G: Layer, D: Layer> GanTrainer<G, D> {
    /// Returns the loss and the mean scores of real and fake samples.
    fn discriminator_step(&mut self, real: VariableD, fake: VariableD) -> Result<(f32, f32, f32)> {
        self.discriminator.set_training(true)?;
        let result = (|| -> Result<_> {
            let real_logits = self.discriminator.forward(real)?;
            let fake_logits = self.discriminator.forward(fake)?;
            let real_score = mean_probability(&real_logits);
            let fake_score = mean_probability(&fake_logits);
            let loss = bce(real_logits, 1.)?.add(&bce(fake_logits, 0.)?)?;
            loss.backward()?;
            self.discriminator
                .update(self.discriminator_learning_rate, &self.optimizer)?;
            Ok((loss.scalar(), real_score, fake_score))
        })();
        self.discriminator.set_training(false)?;
        result
    }
    /// Updates the generator only. The discriminator is not training, so it passes gradients
    /// through to the generated samples without computing its own.
    fn generator_step(&mut self, batch_size: usize) -> Result<f32> {
        let z = Variable::from(self.sample_latent(batch_size).into_dyn());
        self.generator.set_training(true)?;
        let result = (|| -> Result<_> {
            let fake = self.generator.forward(z)?;
            let loss = bce(self.discriminator.forward(fake)?, 1.)?;
            loss.backward()?;
            self.generator
                .update(self.generator_learning_rate, &self.optimizer)?;
            Ok(loss.scalar())
        })();
        self.generator.set_training(false)?;
        result
    }
}

fn bce(logits: VariableD, label: f32) -> Result<Variable0> {
    let target = ArrayD::from_elem(logits.raw_dim(), label);
    BceWithLogitsLoss.eval(logits, &target)
}

fn mean_probability(logits: &VariableD) -> f32 {
    logits.value().mapv(sigmoid).mean().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::layer::{Dense, Tanh};
    use ndarray::Array;

    #[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
    #[gradnotes(crate)]
    struct Generator {
        #[gradnotes(layer)]
        dense: Dense,
        #[gradnotes(layer)]
        tanh: Tanh,
    }

    #[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
    #[gradnotes(crate)]
    struct Discriminator {
        #[gradnotes(layer)]
        dense: Dense,
    }

    fn trainer() -> GanTrainer<Generator, Discriminator> {
        let generator = Generator {
            dense: Dense::from_inputs_outputs(2, 3).with_bias(true).unwrap(),
            tanh: Tanh,
        };
        let discriminator = Discriminator {
            dense: Dense::from_inputs_outputs(3, 1).with_bias(true).unwrap(),
        };
        GanTrainer::new(generator, discriminator, 2)
            .with_learning_rates(0.05, 0.05)
            .unwrap()
            .with_seed(0)
    }

    #[test]
    fn gan_step_updates_both_networks() {
        let mut trainer = trainer();
        let generator = trainer.generator().parameters();
        let discriminator = trainer.discriminator().parameters();
        let real = Array::from_elem([8, 3], 0.5f32);
        let stats = trainer.step(&real).unwrap();
        assert_eq!(trainer.steps(), 1);
        assert!(stats.discriminator_loss.is_finite() && stats.generator_loss.is_finite());
        assert!((0. ..=1.).contains(&stats.real_score));
        for (before, after) in generator.iter().zip(trainer.generator().parameters()) {
            assert_ne!(before.value(), after.value());
            assert!(after.grad().is_none());
        }
        for (before, after) in discriminator
            .iter()
            .zip(trainer.discriminator().parameters())
        {
            assert_ne!(before.value(), after.value());
            assert!(after.grad().is_none());
        }
        assert_eq!(trainer.sample(5).unwrap().shape(), &[5, 3]);
    }

    #[test]
    fn generator_step_leaves_discriminator() {
        let mut trainer = trainer();
        let generator = trainer.generator().parameters();
        let discriminator = trainer.discriminator().parameters();
        let loss = trainer.generator_step(8).unwrap();
        assert!(loss.is_finite());
        for (before, after) in generator.iter().zip(trainer.generator().parameters()) {
            assert_ne!(before.value(), after.value());
        }
        for (before, after) in discriminator
            .iter()
            .zip(trainer.discriminator().parameters())
        {
            assert_eq!(before.value(), after.value());
            assert!(after.grad().is_none());
            assert!(after.optimizer_state().is_none());
        }
    }

    #[test]
    fn gan_step_checks_shapes() {
        let mut trainer = trainer();
        assert!(trainer.step(&Array::<f32, _>::zeros([4, 2])).is_err());
        assert!(trainer.step(&Array::<f32, _>::zeros([0, 3])).is_err());
        assert!(trainer.with_learning_rates(0., 0.1).is_err());
    }
}

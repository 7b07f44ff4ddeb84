use crate::result::Result;
#[cfg(feature = "dataset")]
use crate::dataset::BatchOptions;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    iter::empty,
    path::Path,
    time::{Duration, Instant},
};

/// Generative adversarial networks.
#[cfg(feature = "neural-network")]
pub mod gan;
/// Neural Networks.
#[cfg(feature = "neural-network")]
pub mod neural_network;

/// Inference.
pub trait Infer<X> {
    /// The output.
    type Output;
    /// Computes the output of the model for `input`.
    ///
    /// **Errors**
    /// The input is not valid for the model.
    fn infer(&self, input: X) -> Result<Self::Output>;
}

/// Training / Testing statistics.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: Option<f32>,
    correct: Option<usize>,
    total: usize,
}

impl Stats {
    /// Adds a batch of `count` samples with mean `loss`.
    ///
    /// `correct` is (correct, total) predictions, for classifiers. The total may be less than
    /// `count` when predictions are ignored (ie padding) or more (ie sequences).
    pub fn add_batch(&mut self, count: usize, loss: f32, correct: Option<(usize, usize)>) {
        self.count += count;
        *self.loss.get_or_insert(0.) += loss * count as f32;
        if let Some((correct, total)) = correct {
            *self.correct.get_or_insert(0) += correct;
            self.total += total;
        }
    }
    /// The number of samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean loss.
    pub fn loss(&self) -> Option<f32> {
        self.loss
            .filter(|_| self.count > 0)
            .map(|loss| loss / self.count as f32)
    }
    /// The number of correct predictions.
    pub fn correct(&self) -> Option<usize> {
        self.correct
    }
    /// The fraction of correct predictions.
    pub fn accuracy(&self) -> Option<f32> {
        self.correct
            .filter(|_| self.total > 0)
            .map(|correct| correct as f32 / self.total as f32)
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.loss() {
            Some(loss) => write!(f, "loss: {loss:.5}")?,
            None => write!(f, "loss: -")?,
        }
        if let Some(accuracy) = self.accuracy() {
            write!(f, " accuracy: {:.2}%", accuracy * 100.)?;
        }
        Ok(())
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
    test: Stats,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<(Stats, Stats)>
    where
        F: FnMut(&Self) -> Result<(Stats, Stats)>,
    {
        let start = Instant::now();
        let (train, test) = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        self.test = test;
        Ok((train, test))
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The time of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The total time of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The training stats of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
    /// The testing stats of the last epoch.
    pub fn test(&self) -> &Stats {
        &self.test
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "epoch: {} elapsed: {:.2?} total: {:.2?} train {}",
            self.epoch, self.epoch_time, self.total_time, self.train
        )?;
        if self.test.count() > 0 {
            write!(f, " test {}", self.test)?;
        }
        Ok(())
    }
}

/// Summerizes the trainer.
pub trait Summarize {
    /// Returns a summary.
    fn summarize(&self) -> Summary;
}

/// Training.
///
/// [`Train`] is a general purpose trait for machine learning "trainers" that train a model, potentially iteratively with several "epochs". [`.train()`](Train::train()) trains the model
///
/// # Summary
/// Implement [`Summarize`], as the trainer is expected to compute a summary on each call to [`.train()`](Train::train()). Use [`Summary::run_epoch()`] to compute the next summary.
///
/// # Test
/// Implement [`Test`] so that the model can be tested without exclusive access.
///
/// # serde
/// Implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading checkpoints.
pub trait Train<X> {
    /// Trains the model with the training and testing sets.
    ///
    /// Returns (`train_stats`, `test_stats`).
    ///
    /// **Errors**
    /// Returns an error if training / testing could not be performed. The trainer may be modified even when returning an error.
    fn train_test<I1, I2>(&mut self, train_iter: I1, test_iter: I2) -> Result<(Stats, Stats)>
    where
        I1: IntoIterator<Item = X>,
        I2: IntoIterator<Item = X>;
    /// Trains the model with the training set.
    ///
    /// Returns the training stats.
    ///
    /// **Errors**
    /// Returns an error if training could not be performed. The trainer may be modified even when returning an error.
    fn train<I>(&mut self, train_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = X>,
    {
        Ok(self.train_test(train_iter, empty())?.0)
    }
}

/// Testing / Evaluation.
///
/// [`Test`] is a general purpose trait for testing / evaluating a trainer / model.
pub trait Test<X> {
    /// Tests the model with the test data.
    ///
    /// Unlike [`Train::train_test()`], this method does not require mutable (exclusive) access.
    ///
    /// Returns the testing stats.
    ///
    /// **Errors**
    /// Returns an error if testing could not be performed.
    fn test<I>(&self, test_iter: I) -> Result<Stats>
    where
        I: IntoIterator<Item = X>;
}

/// Options for fitting a model.
///
/// Missing fields take their default values when deserialized, so a config file only needs
/// the options it changes.
///
///```
/// # use gradnotes::learn::FitOptions;
/// let options: FitOptions = serde_json::from_str(r#"{ "epochs": 2, "learning_rate": 0.01 }"#).unwrap();
/// assert_eq!(options.epochs, 2);
/// assert_eq!(options.batch_size, FitOptions::default().batch_size);
///```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// The number of epochs.
    pub epochs: usize,
    /// The learning rate.
    pub learning_rate: f32,
    /// The training batch size.
    pub batch_size: usize,
    /// The testing batch size.
    pub test_batch_size: usize,
    /// Shuffle the training set each epoch.
    pub shuffle: bool,
    /// Drop the last training batch if it is short.
    pub drop_last: bool,
    /// Seed for shuffling, random if not specified.
    pub seed: Option<u64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 0.001,
            batch_size: 100,
            test_batch_size: 1000,
            shuffle: true,
            drop_last: true,
            seed: None,
        }
    }
}

impl FitOptions {
    /// Loads options from a json file.
    ///
    /// **Errors**
    /// The file can not be read or is not valid.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = serde_json::from_str(&fs::read_to_string(path)?)?;
        log::debug!("loaded {options:?} from {path:?}");
        Ok(options)
    }
    /// Batch options for training in epoch `epoch`.
    ///
    /// The seed is offset by the epoch so that each epoch is shuffled differently.
    #[cfg(feature = "dataset")]
    pub fn train_batch_options(&self, epoch: usize) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            drop_last: self.drop_last,
            seed: self.seed.map(|seed| seed.wrapping_add(epoch as u64)),
        }
    }
    /// Batch options for testing.
    #[cfg(feature = "dataset")]
    pub fn test_batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.test_batch_size,
            shuffle: false,
            drop_last: false,
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stats_mean_loss_and_accuracy() {
        let mut stats = Stats::default();
        assert_eq!(stats.loss(), None);
        assert_eq!(stats.to_string(), "loss: -");
        stats.add_batch(10, 1., Some((5, 10)));
        stats.add_batch(30, 3., Some((24, 30)));
        assert_eq!(stats.count(), 40);
        assert_eq!(stats.loss(), Some(2.5));
        assert_eq!(stats.correct(), Some(29));
        assert_eq!(stats.accuracy(), Some(29. / 40.));
        assert_eq!(stats.to_string(), "loss: 2.50000 accuracy: 72.50%");
    }

    #[test]
    fn summary_run_epoch() {
        let mut summary = Summary::default();
        summary
            .run_epoch(|summary| {
                assert_eq!(summary.epoch(), 0);
                let mut train = Stats::default();
                train.add_batch(1, 0.5, None);
                Ok((train, Stats::default()))
            })
            .unwrap();
        assert_eq!(summary.epoch(), 1);
        assert_eq!(summary.train().loss(), Some(0.5));
        assert!(summary.total_time() >= summary.epoch_time());
        let line = summary.to_string();
        assert!(line.starts_with("epoch: 1 "));
        assert!(!line.contains("test"));
        assert!(summary
            .run_epoch(|_| anyhow::bail!("interrupted"))
            .is_err());
        assert_eq!(summary.epoch(), 1);
    }

    #[test]
    fn fit_options_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "epochs": 3, "seed": 7, "shuffle": false }}"#).unwrap();
        let options = FitOptions::from_json_file(file.path()).unwrap();
        assert_eq!(options.epochs, 3);
        assert_eq!(options.seed, Some(7));
        assert!(!options.shuffle);
        assert_eq!(options.batch_size, 100);
        write!(file, "not json").unwrap();
        assert!(FitOptions::from_json_file(file.path()).is_err());
    }

    #[cfg(feature = "dataset")]
    #[test]
    fn fit_options_seed_shuffles_only() {
        let options = FitOptions {
            seed: Some(u64::MAX),
            ..FitOptions::default()
        };
        assert_eq!(options.train_batch_options(0).seed, Some(u64::MAX));
        assert_eq!(options.train_batch_options(1).seed, Some(0));
        assert_eq!(options.test_batch_options().seed, None);
        assert!(!options.test_batch_options().shuffle);
    }
}

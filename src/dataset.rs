use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{Array, Array2, ArrayBase, ArrayView, Axis, Data, Dimension, RemoveAxis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The IDX file format.
pub mod idx;
/// The MNIST and FashionMNIST datasets.
#[cfg(feature = "mnist")]
pub mod mnist;
/// Sequence tagging.
pub mod tagging;

/// Scales u8 images into f32 values in [0, 1].
pub fn scale_images<S, D>(images: &ArrayBase<S, D>) -> Array<f32, D>
where
    S: Data<Elem = u8>,
    D: Dimension,
{
    images.mapv(|x| x as f32 / 255.)
}

/// Converts u8 classes into class indices, ie for [`CrossEntropyLoss`](crate::learn::neural_network::criterion::CrossEntropyLoss).
pub fn class_indices<S, D>(classes: &ArrayBase<S, D>) -> Array<usize, D>
where
    S: Data<Elem = u8>,
    D: Dimension,
{
    classes.mapv(usize::from)
}

/// One hot encodes `classes` into (classes.len(), `nclasses`).
///
/// **Errors**
/// A class is not less than `nclasses`.
pub fn one_hot<'a>(
    classes: impl IntoIterator<Item = &'a u8>,
    nclasses: usize,
) -> Result<Array2<f32>> {
    let classes: Vec<usize> = classes.into_iter().copied().map(usize::from).collect();
    let mut output = Array2::zeros([classes.len(), nclasses]);
    for (mut row, class) in output.outer_iter_mut().zip(classes) {
        match row.get_mut(class) {
            Some(x) => *x = 1.,
            None => bail!("class {class} out of range for {nclasses} classes!"),
        }
    }
    Ok(output)
}

/// Options for [`batches`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// The number of samples per batch.
    pub batch_size: usize,
    /// Shuffle the samples.
    pub shuffle: bool,
    /// Drop the last batch if it is smaller than `batch_size`.
    pub drop_last: bool,
    /// Seed for shuffling, random if not specified.
    pub seed: Option<u64>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            shuffle: false,
            drop_last: false,
            seed: None,
        }
    }
}

/// Iterator over batches of samples, see [`batches`].
#[derive(Debug)]
pub struct Batches<'a, X, Y, D1: Dimension, D2: Dimension> {
    x: ArrayView<'a, X, D1>,
    y: ArrayView<'a, Y, D2>,
    indices: Vec<usize>,
    batch_size: usize,
    position: usize,
    end: usize,
}

/// Batches `x` and `y` along the first axis.
///
/// Each item is an owned (x, y) pair of `batch_size` samples, except for the last which may be
/// smaller unless `drop_last` is set.
///
/// **Errors**
/// - The batch size is 0.
/// - `x` and `y` have a different number of samples.
pub fn batches<'a, X, Y, S1, S2, D1, D2>(
    x: &'a ArrayBase<S1, D1>,
    y: &'a ArrayBase<S2, D2>,
    options: &BatchOptions,
) -> Result<Batches<'a, X, Y, D1, D2>>
where
    X: Clone,
    Y: Clone,
    S1: Data<Elem = X>,
    S2: Data<Elem = Y>,
    D1: RemoveAxis,
    D2: RemoveAxis,
{
    let BatchOptions {
        batch_size,
        shuffle,
        drop_last,
        seed,
    } = *options;
    ensure!(batch_size > 0, "batch_size must be positive!");
    let samples = x.len_of(Axis(0));
    ensure!(
        samples == y.len_of(Axis(0)),
        "x has {samples} samples but y has {}!",
        y.len_of(Axis(0))
    );
    let mut indices: Vec<usize> = (0..samples).collect();
    if shuffle {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        indices.shuffle(&mut rng);
    }
    let end = if drop_last {
        samples - samples % batch_size
    } else {
        samples
    };
    Ok(Batches {
        x: x.view(),
        y: y.view(),
        indices,
        batch_size,
        position: 0,
        end,
    })
}

impl<X, Y, D1, D2> Iterator for Batches<'_, X, Y, D1, D2>
where
    X: Clone,
    Y: Clone,
    D1: RemoveAxis,
    D2: RemoveAxis,
{
    type Item = (Array<X, D1>, Array<Y, D2>);
    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let next = (self.position + self.batch_size).min(self.end);
        let indices = &self.indices[self.position..next];
        self.position = next;
        Some((
            self.x.select(Axis(0), indices),
            self.y.select(Axis(0), indices),
        ))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end - self.position;
        let len = remaining / self.batch_size + usize::from(remaining % self.batch_size != 0);
        (len, Some(len))
    }
}

impl<X, Y, D1, D2> ExactSizeIterator for Batches<'_, X, Y, D1, D2>
where
    X: Clone,
    Y: Clone,
    D1: RemoveAxis,
    D2: RemoveAxis,
{
}

/// Splits `n` samples into (train, test) ranges, with the last `test_ratio` of the samples for testing.
///
/// **Errors**
/// `test_ratio` is not in [0, 1].
pub fn train_test_split(n: usize, test_ratio: f32) -> Result<(Range<usize>, Range<usize>)> {
    ensure!(
        (0. ..=1.).contains(&test_ratio),
        "test_ratio must be in [0, 1], found {test_ratio}!"
    );
    let test = ((n as f32 * test_ratio).round() as usize).min(n);
    Ok((0..n - test, n - test..n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn scaled_images_in_unit_interval() {
        let images = array![[0u8, 128], [255, 1]];
        let x = scale_images(&images);
        assert!(x.iter().all(|x| (0. ..=1.).contains(x)));
        assert_eq!(x[[1, 0]], 1.);
        assert_eq!(class_indices(&array![3u8, 9]), array![3usize, 9]);
    }

    #[test]
    fn one_hot_rows() {
        let y = one_hot(&array![2u8, 0], 3).unwrap();
        assert_eq!(y, array![[0., 0., 1.], [1., 0., 0.]]);
        assert!(one_hot(&array![3u8], 3).is_err());
    }

    #[test]
    fn batches_keep_shape_except_last() {
        let x = Array::from_shape_fn([10, 2, 3], |(i, _, _)| i as f32);
        let y = Array1::from_shape_fn(10, |i| i);
        let options = BatchOptions {
            batch_size: 4,
            ..BatchOptions::default()
        };
        let batches: Vec<_> = batches(&x, &y, &options).unwrap().collect();
        assert_eq!(batches.len(), 3);
        for (x, y) in batches.iter().take(2) {
            assert_eq!(x.shape(), &[4, 2, 3]);
            assert_eq!(y.len(), 4);
        }
        assert_eq!(batches[2].0.shape(), &[2, 2, 3]);
        assert_eq!(batches[2].1, array![8, 9]);
        let options = BatchOptions {
            drop_last: true,
            ..options
        };
        let iter = super::batches(&x, &y, &options).unwrap();
        assert_eq!(iter.len(), 2);
        assert!(iter.into_iter().all(|(x, _)| x.shape() == [4, 2, 3]));
    }

    #[test]
    fn shuffled_batches_are_seeded_permutations() {
        let x = Array1::from_shape_fn(20, |i| i as f32);
        let y = Array1::from_shape_fn(20, |i| i);
        let options = BatchOptions {
            batch_size: 6,
            shuffle: true,
            seed: Some(1),
            ..BatchOptions::default()
        };
        let collect = || {
            batches(&x, &y, &options)
                .unwrap()
                .flat_map(|(x, y)| {
                    assert_eq!(x.mapv(|x| x as usize), y);
                    y.to_vec()
                })
                .collect::<Vec<_>>()
        };
        let first = collect();
        assert_eq!(first, collect());
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_ne!(first, sorted);
    }

    #[test]
    fn batches_errors() {
        let x = Array1::<f32>::zeros(4);
        let y = Array1::<usize>::zeros(3);
        assert!(batches(&x, &y, &BatchOptions::default()).is_err());
        let options = BatchOptions {
            batch_size: 0,
            ..BatchOptions::default()
        };
        assert!(batches(&x, &x, &options).is_err());
    }

    #[test]
    fn split() {
        assert_eq!(train_test_split(70, 1. / 7.).unwrap(), (0..60, 60..70));
        assert_eq!(train_test_split(3, 0.).unwrap(), (0..3, 3..3));
        assert!(train_test_split(3, 1.5).is_err());
    }
}

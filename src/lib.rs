/*!
# gradnotes
Small neural networks on the CPU: a GAN, a CNN classifier, an LSTM sequence tagger and an
autoencoder, together with the pieces they need.

- [`dataset`]: IDX parsing, MNIST download and caching, batching and a synthetic tagging corpus.
- [`learn::neural_network`]: variables with reverse mode autodiff, layers, criterions and
optimizers.
- [`learn::gan`]: alternating generator / discriminator updates.
- [`viz`]: ASCII heatmaps for the console.

# Features
- "dataset": IDX parsing and batching.
- "mnist": MNIST / FashionMNIST, downloaded with curl.
- "learn": [`Stats`](learn::Stats), [`Summary`](learn::Summary) and the training traits.
- "neural-network": networks, derives for [`Layer`](learn::neural_network::layer::Layer).
*/
#![cfg_attr(doc_cfg, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Datasets.
#[cfg(feature = "dataset")]
pub mod dataset;
/// Machine learning.
#[cfg(feature = "learn")]
pub mod learn;
/// Result.
pub mod result;
/// Console visualization.
pub mod viz;

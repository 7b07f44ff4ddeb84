use anyhow::Context;
use clap::Parser;
use gradnotes::{
    dataset::{
        batches, class_indices,
        mnist::{Mnist, MnistKind},
        scale_images,
    },
    learn::{
        neural_network::{
            criterion::softmax,
            layer::{Conv, Dense, Flatten, Forward, Layer, MaxPool, Relu},
            optimizer::Adam,
            Network, NetworkTrainer,
        },
        FitOptions, Infer, Summarize, Train,
    },
    result::Result,
    viz::{image_grid, probability_bars},
};
use ndarray::{s, Axis, Ix2};
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trains a LeNet5 style CNN classifier on MNIST.")]
struct Options {
    /// Number of epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// Training batch size.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Learning rate.
    #[arg(long)]
    learning_rate: Option<f32>,
    /// Seed for shuffling.
    #[arg(long)]
    seed: Option<u64>,
    /// The dataset cache directory.
    #[arg(long, default_value = "data")]
    data: PathBuf,
    /// Use FashionMNIST.
    #[arg(long)]
    fashion: bool,
    /// Do not download missing files.
    #[arg(long)]
    offline: bool,
    /// Json file with fit options, overridden by flags.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Save the trained network to a json file.
    #[arg(long)]
    save: Option<PathBuf>,
}

impl Options {
    fn fit_options(&self) -> Result<FitOptions> {
        let mut fit = match self.config.as_ref() {
            Some(path) => FitOptions::from_json_file(path)?,
            None => FitOptions::default(),
        };
        if let Some(epochs) = self.epochs {
            fit.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            fit.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            fit.learning_rate = learning_rate;
        }
        fit.seed = self.seed.or(fit.seed);
        Ok(fit)
    }
}

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
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

impl Lenet5 {
    fn new() -> Result<Self> {
        Ok(Self {
            conv1: Conv::from_inputs_outputs_kernel(1, 6, [5, 5]).with_bias(true)?,
            relu1: Relu,
            pool1: MaxPool::from_kernel([2, 2]),
            conv2: Conv::from_inputs_outputs_kernel(6, 16, [5, 5]).with_bias(true)?,
            relu2: Relu,
            pool2: MaxPool::from_kernel([2, 2]),
            flatten: Flatten,
            dense1: Dense::from_inputs_outputs(16 * 4 * 4, 120).with_bias(true)?,
            relu3: Relu,
            dense2: Dense::from_inputs_outputs(120, 84).with_bias(true)?,
            relu4: Relu,
            dense3: Dense::from_inputs_outputs(84, 10).with_bias(true)?,
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
    let fit = options.fit_options()?;
    log::debug!("{fit:?}");

    let kind = if options.fashion {
        MnistKind::Fashion
    } else {
        MnistKind::Digits
    };
    let mnist = Mnist::builder()
        .path(&options.data)
        .kind(kind)
        .download(!options.offline)
        .build()?;
    let train_x = scale_images(mnist.train_images());
    let train_t = class_indices(mnist.train_classes());
    let test_x = scale_images(mnist.test_images());
    let test_t = class_indices(mnist.test_classes());
    println!(
        "{kind}: {} training images, {} testing images",
        train_t.len().to_formatted_string(&Locale::en),
        test_t.len().to_formatted_string(&Locale::en),
    );

    let optimizer = Adam::builder().gradient_centralization(true).build()?;
    let mut trainer = NetworkTrainer::from_network(Network(Lenet5::new()?))
        .with_optimizer(optimizer)
        .with_learning_rate(fit.learning_rate)?;
    for epoch in 0..fit.epochs {
        let train_iter = batches(&train_x, &train_t, &fit.train_batch_options(epoch))?;
        let test_iter = batches(&test_x, &test_t, &fit.test_batch_options())?;
        trainer.train_test(train_iter, test_iter)?;
        println!("{}", trainer.summarize());
    }

    let samples = test_x.slice(s![..4, .., .., ..]);
    let logits = trainer
        .network()
        .infer(&samples)?
        .into_dimensionality::<Ix2>()?;
    let probabilities = softmax(logits.view());
    println!("{}", image_grid(samples.index_axis(Axis(1), 0), 4));
    let labels: Vec<String> = (0..10).map(|class| class.to_string()).collect();
    let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
    for (p, t) in probabilities.outer_iter().zip(test_t.iter()) {
        println!("target: {t}\n{}", probability_bars(p, &labels));
    }

    if let Some(path) = options.save.as_ref() {
        trainer
            .save_json(path)
            .with_context(|| format!("failed to save {path:?}"))?;
    }
    Ok(())
}

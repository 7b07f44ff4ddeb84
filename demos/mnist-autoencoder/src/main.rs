use anyhow::Context;
use clap::Parser;
use gradnotes::{
    dataset::{
        batches,
        mnist::{Mnist, MnistKind},
        scale_images,
    },
    learn::{
        neural_network::{
            criterion::MseLoss,
            layer::{Dense, Forward, Layer, Relu, Sigmoid},
            optimizer::Adam,
            Network, NetworkTrainer,
        },
        FitOptions, Infer, Summarize, Train,
    },
    result::Result,
    viz::image_grid,
};
use ndarray::{concatenate, s, Array2, Axis};
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trains a dense autoencoder on MNIST.")]
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
    /// Size of the code.
    #[arg(long, default_value_t = 32)]
    code: usize,
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

const PIXELS: usize = 28 * 28;

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
struct Autoencoder {
    #[gradnotes(layer)]
    encode1: Dense,
    #[gradnotes(layer)]
    relu1: Relu,
    #[gradnotes(layer)]
    encode2: Dense,
    #[gradnotes(layer)]
    relu2: Relu,
    #[gradnotes(layer)]
    decode1: Dense,
    #[gradnotes(layer)]
    relu3: Relu,
    #[gradnotes(layer)]
    decode2: Dense,
    #[gradnotes(layer)]
    sigmoid: Sigmoid,
}

impl Autoencoder {
    fn new(code: usize) -> Result<Self> {
        Ok(Self {
            encode1: Dense::from_inputs_outputs(PIXELS, 128).with_bias(true)?,
            relu1: Relu,
            encode2: Dense::from_inputs_outputs(128, code).with_bias(true)?,
            relu2: Relu,
            decode1: Dense::from_inputs_outputs(code, 128).with_bias(true)?,
            relu3: Relu,
            decode2: Dense::from_inputs_outputs(128, PIXELS).with_bias(true)?,
            sigmoid: Sigmoid,
        })
    }
}

fn flat_images(images: &ndarray::Array4<u8>) -> Result<Array2<f32>> {
    let count = images.len_of(Axis(0));
    Ok(scale_images(images).into_shape([count, PIXELS])?)
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
    let mut fit = match options.config.as_ref() {
        Some(path) => FitOptions::from_json_file(path)?,
        None => FitOptions::default(),
    };
    fit.epochs = options.epochs.unwrap_or(fit.epochs);
    fit.batch_size = options.batch_size.unwrap_or(fit.batch_size);
    fit.learning_rate = options.learning_rate.unwrap_or(fit.learning_rate);
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
    let train_x = flat_images(mnist.train_images())?;
    let test_x = flat_images(mnist.test_images())?;
    println!(
        "{kind}: {} training images, {} testing images",
        train_x.nrows().to_formatted_string(&Locale::en),
        test_x.nrows().to_formatted_string(&Locale::en),
    );

    let mut trainer = NetworkTrainer::from_network(Network(Autoencoder::new(options.code)?))
        .with_criterion(MseLoss)
        .with_optimizer(Adam::default())
        .with_learning_rate(fit.learning_rate)?;
    for epoch in 0..fit.epochs {
        let train_iter = batches(&train_x, &train_x, &fit.train_batch_options(epoch))?;
        let test_iter = batches(&test_x, &test_x, &fit.test_batch_options())?;
        trainer.train_test(train_iter, test_iter)?;
        println!("{}", trainer.summarize());
    }

    // originals on the first line of the grid, reconstructions on the second
    let samples = test_x.slice(s![..4, ..]);
    let reconstructions = trainer.network().infer(&samples)?;
    let images = concatenate(
        Axis(0),
        &[
            samples.into_shape([4, 28, 28])?,
            reconstructions.view().into_shape([4, 28, 28])?,
        ],
    )?;
    println!("{}", image_grid(images.view(), 4));

    if let Some(path) = options.save.as_ref() {
        trainer
            .save_json(path)
            .with_context(|| format!("failed to save {path:?}"))?;
    }
    Ok(())
}

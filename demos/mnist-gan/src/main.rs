use anyhow::Context;
use clap::Parser;
use gradnotes::{
    dataset::{
        batches,
        mnist::{Mnist, MnistKind},
        scale_images, BatchOptions,
    },
    learn::{
        gan::{GanStats, GanTrainer},
        neural_network::layer::{Dense, Forward, Layer, LeakyRelu, Relu, Sigmoid},
    },
    result::Result,
    viz::image_grid,
};
use ndarray::Axis;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufWriter, path::PathBuf, time::Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Trains a dense GAN on MNIST.")]
struct Options {
    /// Number of epochs.
    #[arg(long, default_value_t = 5)]
    epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 64)]
    batch_size: usize,
    /// Learning rate of both the generator and the discriminator.
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f32,
    /// Number of latent features.
    #[arg(long, default_value_t = 64)]
    latent: usize,
    /// Seed for the latent noise and shuffling.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// The dataset cache directory.
    #[arg(long, default_value = "data")]
    data: PathBuf,
    /// Use FashionMNIST.
    #[arg(long)]
    fashion: bool,
    /// Do not download missing files.
    #[arg(long)]
    offline: bool,
    /// Save the trained generator to a json file.
    #[arg(long)]
    save: Option<PathBuf>,
}

const PIXELS: usize = 28 * 28;

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
struct Generator {
    #[gradnotes(layer)]
    dense1: Dense,
    #[gradnotes(layer)]
    relu: Relu,
    #[gradnotes(layer)]
    dense2: Dense,
    #[gradnotes(layer)]
    sigmoid: Sigmoid,
}

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
struct Discriminator {
    #[gradnotes(layer)]
    dense1: Dense,
    #[gradnotes(layer)]
    relu: LeakyRelu,
    #[gradnotes(layer)]
    dense2: Dense,
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
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
    let images = mnist.train_images();
    let count = images.len_of(Axis(0));
    let x = scale_images(images).into_shape([count, PIXELS])?;
    let classes = mnist.train_classes();
    println!(
        "{kind}: {} training images",
        count.to_formatted_string(&Locale::en)
    );

    let generator = Generator {
        dense1: Dense::from_inputs_outputs(options.latent, 256).with_bias(true)?,
        relu: Relu,
        dense2: Dense::from_inputs_outputs(256, PIXELS).with_bias(true)?,
        sigmoid: Sigmoid,
    };
    let discriminator = Discriminator {
        dense1: Dense::from_inputs_outputs(PIXELS, 256).with_bias(true)?,
        relu: LeakyRelu::new(0.2),
        dense2: Dense::from_inputs_outputs(256, 1).with_bias(true)?,
    };
    let mut trainer = GanTrainer::new(generator, discriminator, options.latent)
        .with_learning_rates(options.learning_rate, options.learning_rate)?
        .with_seed(options.seed);

    let start = Instant::now();
    for epoch in 1..=options.epochs {
        let batch_options = BatchOptions {
            batch_size: options.batch_size,
            shuffle: true,
            drop_last: true,
            seed: Some(options.seed.wrapping_add(epoch as u64)),
        };
        let mut total = GanStats::default();
        let mut steps = 0;
        for (real, _) in batches(&x, classes, &batch_options)? {
            let stats = trainer.step(&real)?;
            total.discriminator_loss += stats.discriminator_loss;
            total.generator_loss += stats.generator_loss;
            total.real_score += stats.real_score;
            total.fake_score += stats.fake_score;
            steps += 1;
        }
        let n = steps.max(1) as f32;
        let mean = GanStats {
            discriminator_loss: total.discriminator_loss / n,
            generator_loss: total.generator_loss / n,
            real_score: total.real_score / n,
            fake_score: total.fake_score / n,
        };
        log::info!("epoch {epoch}: {steps} steps");
        println!("epoch: {epoch} elapsed: {:.2?} {mean}", start.elapsed());
    }

    let samples = trainer.sample(8)?.into_shape([8, 28, 28])?;
    println!("{}", image_grid(samples.view(), 4));

    if let Some(path) = options.save.as_ref() {
        let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
        serde_json::to_writer(BufWriter::new(file), trainer.generator())?;
        log::info!("saved generator to {path:?}");
    }
    Ok(())
}

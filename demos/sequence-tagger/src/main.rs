use anyhow::Context;
use clap::Parser;
use gradnotes::{
    dataset::{
        tagging::{encode_batch, SyntheticCorpus, TaggingBatches},
        train_test_split,
    },
    learn::{
        neural_network::{
            criterion::CrossEntropyLoss,
            layer::{Dense, Embedding, Forward, Layer, Lstm},
            optimizer::Adam,
            Network, NetworkTrainer,
        },
        FitOptions, Infer, Summarize, Train,
    },
    result::Result,
};
use ndarray::{Axis, Ix3};
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Trains an LSTM sequence tagger on a synthetic named entity corpus."
)]
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
    /// Seed for the corpus and shuffling.
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Number of generated sentences.
    #[arg(long, default_value_t = 2_000)]
    sentences: usize,
    /// Embedding features.
    #[arg(long, default_value_t = 32)]
    features: usize,
    /// LSTM hidden size.
    #[arg(long, default_value_t = 64)]
    hidden: usize,
    /// Json file with fit options, overridden by flags.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Save the trained network to a json file.
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Layer, Forward, Clone, Debug, Serialize, Deserialize)]
struct Tagger {
    #[gradnotes(layer)]
    embedding: Embedding,
    #[gradnotes(layer)]
    lstm: Lstm,
    #[gradnotes(layer)]
    dense: Dense,
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();
    let mut fit = match options.config.as_ref() {
        Some(path) => FitOptions::from_json_file(path)?,
        None => FitOptions {
            epochs: 5,
            learning_rate: 0.01,
            batch_size: 32,
            test_batch_size: 200,
            ..FitOptions::default()
        },
    };
    fit.epochs = options.epochs.unwrap_or(fit.epochs);
    fit.batch_size = options.batch_size.unwrap_or(fit.batch_size);
    fit.learning_rate = options.learning_rate.unwrap_or(fit.learning_rate);
    fit.seed = fit.seed.or(Some(options.seed));
    log::debug!("{fit:?}");

    let corpus = SyntheticCorpus::generate(options.sentences, options.seed);
    let (words, tags) = (corpus.words(), corpus.tags());
    let (train, test) = train_test_split(corpus.sentences().len(), 0.2)?;
    let train_sentences = &corpus.sentences()[train];
    let test_sentences = &corpus.sentences()[test];
    println!(
        "{} training sentences, {} testing sentences, {} words, {} tags",
        train_sentences.len().to_formatted_string(&Locale::en),
        test_sentences.len().to_formatted_string(&Locale::en),
        words.len(),
        tags.len(),
    );

    let network = Tagger {
        embedding: Embedding::from_tokens_features(words.len(), options.features),
        lstm: Lstm::from_inputs_hidden(options.features, options.hidden),
        dense: Dense::from_inputs_outputs(options.hidden, tags.len()).with_bias(true)?,
    };
    let mut trainer = NetworkTrainer::from_network(Network(network))
        .with_criterion(CrossEntropyLoss::default().with_ignore_class(tags.pad_id()))
        .with_optimizer(Adam::default())
        .with_learning_rate(fit.learning_rate)?;
    for epoch in 0..fit.epochs {
        let train_iter =
            TaggingBatches::new(train_sentences, words, tags, &fit.train_batch_options(epoch))?;
        let test_iter =
            TaggingBatches::new(test_sentences, words, tags, &fit.test_batch_options())?;
        trainer.train_test(train_iter, test_iter)?;
        println!("{}", trainer.summarize());
    }

    let samples = &test_sentences[..test_sentences.len().min(4)];
    let (word_ids, _) = encode_batch(samples, words, tags)?;
    let logits = trainer
        .network()
        .infer(&word_ids)?
        .into_dimensionality::<Ix3>()?;
    for (sentence, logits) in samples.iter().zip(logits.outer_iter()) {
        let predicted = logits.axis_iter(Axis(0)).map(|scores| {
            let class = scores
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, x)| {
                    if *x > best.1 {
                        (i, *x)
                    } else {
                        best
                    }
                })
                .0;
            tags.token(class).unwrap_or("?")
        });
        let line: Vec<String> = sentence
            .words()
            .iter()
            .zip(sentence.tags())
            .zip(predicted)
            .map(|((word, tag), predicted)| {
                if tag == predicted {
                    format!("{word}/{tag}")
                } else {
                    format!("{word}/{predicted}(!{tag})")
                }
            })
            .collect();
        println!("{}", line.join(" "));
    }

    if let Some(path) = options.save.as_ref() {
        trainer
            .save_json(path)
            .with_context(|| format!("failed to save {path:?}"))?;
    }
    Ok(())
}

use gradnotes::{
    dataset::{
        batches,
        tagging::{SyntheticCorpus, TaggingBatches},
        BatchOptions,
    },
    learn::{
        neural_network::{
            criterion::{CrossEntropyLoss, MseLoss},
            layer::{
                Conv, Dense, Embedding, Flatten, Forward, Layer, Lstm, MaxPool, Relu, Sigmoid,
                Tanh,
            },
            optimizer::Adam,
            Network, NetworkTrainer,
        },
        Summarize, Test, Train,
    },
};
use ndarray::{Array1, Array2, Array4};

fn options(batch_size: usize, seed: u64) -> BatchOptions {
    BatchOptions {
        batch_size,
        shuffle: true,
        drop_last: false,
        seed: Some(seed),
    }
}

#[derive(Layer, Forward)]
struct BarNet {
    #[gradnotes(layer)]
    conv: Conv,
    #[gradnotes(layer)]
    relu: Relu,
    #[gradnotes(layer)]
    pool: MaxPool,
    #[gradnotes(layer)]
    flatten: Flatten,
    #[gradnotes(layer)]
    dense: Dense,
}

/// Horizontal (class 0) and vertical (class 1) bars.
fn bars(count: usize) -> (Array4<f32>, Array1<usize>) {
    let x = Array4::from_shape_fn([count, 1, 6, 6], |(i, _, y, x)| {
        let line = (i / 2) % 6;
        let on = if i % 2 == 0 { y == line } else { x == line };
        if on {
            1.
        } else {
            0.
        }
    });
    let t = Array1::from_shape_fn(count, |i| i % 2);
    (x, t)
}

#[test]
fn cnn_learns_bars() {
    let network = BarNet {
        conv: Conv::from_inputs_outputs_kernel(1, 4, [3, 3])
            .with_padding([1, 1])
            .unwrap()
            .with_bias(true)
            .unwrap(),
        relu: Relu,
        pool: MaxPool::from_kernel([2, 2]),
        flatten: Flatten,
        dense: Dense::from_inputs_outputs(4 * 3 * 3, 2)
            .with_bias(true)
            .unwrap(),
    };
    let optimizer = Adam::builder()
        .gradient_centralization(true)
        .build()
        .unwrap();
    let mut trainer = NetworkTrainer::from_network(Network(network))
        .with_optimizer(optimizer)
        .with_learning_rate(0.01)
        .unwrap();
    let (x, t) = bars(48);
    let before = trainer
        .test(batches(&x, &t, &options(48, 0)).unwrap())
        .unwrap();
    for epoch in 0..20 {
        let train_iter = batches(&x, &t, &options(8, epoch)).unwrap();
        let test_iter = batches(&x, &t, &options(48, 0)).unwrap();
        trainer.train_test(train_iter, test_iter).unwrap();
    }
    let summary = trainer.summarize();
    assert_eq!(summary.epoch(), 20);
    assert_eq!(summary.train().count(), 48);
    assert!(summary.test().loss().unwrap() < before.loss().unwrap());
    assert!(summary.test().accuracy().unwrap() > 0.5);
}

#[derive(Layer, Forward)]
struct Tagger {
    #[gradnotes(layer)]
    embedding: Embedding,
    #[gradnotes(layer)]
    lstm: Lstm,
    #[gradnotes(layer)]
    dense: Dense,
}

#[test]
fn lstm_tagger_reduces_loss() {
    let corpus = SyntheticCorpus::generate(48, 3);
    let network = Tagger {
        embedding: Embedding::from_tokens_features(corpus.words().len(), 8),
        lstm: Lstm::from_inputs_hidden(8, 12),
        dense: Dense::from_inputs_outputs(12, corpus.tags().len())
            .with_bias(true)
            .unwrap(),
    };
    let mut trainer = NetworkTrainer::from_network(Network(network))
        .with_criterion(CrossEntropyLoss::default().with_ignore_class(0))
        .with_optimizer(Adam::default())
        .with_learning_rate(0.02)
        .unwrap();
    let sentences = corpus.sentences();
    let test_iter = || {
        TaggingBatches::new(sentences, corpus.words(), corpus.tags(), &options(16, 0)).unwrap()
    };
    let before = trainer.test(test_iter()).unwrap();
    for epoch in 0..8 {
        let train_iter =
            TaggingBatches::new(sentences, corpus.words(), corpus.tags(), &options(8, epoch))
                .unwrap();
        trainer.train_test(train_iter, test_iter()).unwrap();
    }
    let after = *trainer.summarize().test();
    assert!(after.loss().unwrap() < before.loss().unwrap());
    assert!(after.accuracy().unwrap() > before.accuracy().unwrap());
}

#[derive(Layer, Forward)]
struct Autoencoder {
    #[gradnotes(layer)]
    encoder: Dense,
    #[gradnotes(layer)]
    tanh: Tanh,
    #[gradnotes(layer)]
    decoder: Dense,
    #[gradnotes(layer)]
    sigmoid: Sigmoid,
}

#[test]
fn autoencoder_reduces_reconstruction_error() {
    let x = Array2::from_shape_fn([32, 6], |(i, j)| if (i + j) % 3 == 0 { 1. } else { 0. });
    let network = Autoencoder {
        encoder: Dense::from_inputs_outputs(6, 3).with_bias(true).unwrap(),
        tanh: Tanh,
        decoder: Dense::from_inputs_outputs(3, 6).with_bias(true).unwrap(),
        sigmoid: Sigmoid,
    };
    let mut trainer = NetworkTrainer::from_network(Network(network))
        .with_criterion(MseLoss)
        .with_optimizer(Adam::default())
        .with_learning_rate(0.05)
        .unwrap();
    let before = trainer
        .test(batches(&x, &x, &options(32, 0)).unwrap())
        .unwrap();
    for epoch in 0..30 {
        trainer
            .train(batches(&x, &x, &options(8, epoch)).unwrap())
            .unwrap();
    }
    let after = trainer
        .test(batches(&x, &x, &options(32, 0)).unwrap())
        .unwrap();
    assert!(after.loss().unwrap() < before.loss().unwrap());
    assert_eq!(after.accuracy(), None);
}

use super::BatchOptions;
use crate::result::Result;
use anyhow::{ensure, Context};
use ndarray::Array2;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The padding token, always id 0.
pub const PAD: &str = "<pad>";
/// The unknown word token, id 1 in word vocabularies.
pub const UNK: &str = "<unk>";

/// Maps tokens to ids and back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, usize>,
    unknown: Option<usize>,
}

impl Vocabulary {
    fn with_reserved(reserved: &[&str]) -> Self {
        let mut vocabulary = Self {
            tokens: Vec::new(),
            ids: HashMap::new(),
            unknown: None,
        };
        for token in reserved {
            vocabulary.insert(token);
        }
        vocabulary
    }
    /// A word vocabulary with [`PAD`] and [`UNK`].
    ///
    /// Unknown words are encoded as [`UNK`].
    pub fn words() -> Self {
        let mut vocabulary = Self::with_reserved(&[PAD, UNK]);
        vocabulary.unknown = Some(1);
        vocabulary
    }
    /// A tag vocabulary with [`PAD`].
    ///
    /// Unknown tags can not be encoded.
    pub fn tags() -> Self {
        Self::with_reserved(&[PAD])
    }
    /// Adds `token` if not present, returning its id.
    pub fn insert(&mut self, token: &str) -> usize {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        let id = self.tokens.len();
        self.tokens.push(token.to_string());
        self.ids.insert(token.to_string(), id);
        id
    }
    /// The id of `token`, if present.
    pub fn id(&self, token: &str) -> Option<usize> {
        self.ids.get(token).copied()
    }
    /// The id of `token`, or the unknown id for word vocabularies.
    pub fn encode(&self, token: &str) -> Option<usize> {
        self.id(token).or(self.unknown)
    }
    /// The token with `id`.
    pub fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }
    /// The number of tokens, including reserved tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }
    /// Whether the vocabulary has no tokens.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
    /// The padding id.
    pub fn pad_id(&self) -> usize {
        0
    }
}

/// A sentence with one tag per word.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaggedSentence {
    words: Vec<String>,
    tags: Vec<String>,
}

impl TaggedSentence {
    /// Creates a new [`TaggedSentence`].
    ///
    /// **Errors**
    /// The number of words and tags differ.
    pub fn new(words: Vec<String>, tags: Vec<String>) -> Result<Self> {
        ensure!(
            words.len() == tags.len(),
            "{} words but {} tags!",
            words.len(),
            tags.len()
        );
        Ok(Self { words, tags })
    }
    /// The words.
    pub fn words(&self) -> &[String] {
        &self.words
    }
    /// The tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }
    /// The number of words.
    pub fn len(&self) -> usize {
        self.words.len()
    }
    /// Whether the sentence has no words.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
    fn encode(&self, words: &Vocabulary, tags: &Vocabulary) -> Result<(Vec<usize>, Vec<usize>)> {
        let word_ids = self
            .words
            .iter()
            .map(|word| words.encode(word).with_context(|| format!("unknown word {word:?}!")))
            .collect::<Result<_>>()?;
        let tag_ids = self
            .tags
            .iter()
            .map(|tag| tags.encode(tag).with_context(|| format!("unknown tag {tag:?}!")))
            .collect::<Result<_>>()?;
        Ok((word_ids, tag_ids))
    }
}

const PEOPLE: &[&str] = &["alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi"];
const PLACES: &[&str] = &["paris", "tokyo", "lima", "oslo", "cairo", "quito"];
const ORGANIZATIONS: &[&str] = &["acme", "globex", "initech", "umbrella", "hooli"];
const TAGS: &[&str] = &["O", "PER", "LOC", "ORG"];

const TEMPLATES: &[&str] = &[
    "PER lives in LOC",
    "PER works for ORG",
    "ORG opened an office in LOC",
    "PER met PER at ORG",
    "the weather in LOC is nice today",
    "PER and PER moved to LOC",
    "ORG hired PER last year",
    "we flew from LOC to LOC",
];

/// A generated corpus of tagged sentences.
///
/// Sentences are filled in from templates with people (PER), places (LOC) and organizations
/// (ORG). Other words are tagged O.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyntheticCorpus {
    sentences: Vec<TaggedSentence>,
    words: Vocabulary,
    tags: Vocabulary,
}

impl SyntheticCorpus {
    /// Generates `n` sentences with `seed`.
    pub fn generate(n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sentences = Vec::with_capacity(n);
        for _ in 0..n {
            let template = TEMPLATES[rng.gen_range(0..TEMPLATES.len())];
            let mut words = Vec::new();
            let mut tags = Vec::new();
            for slot in template.split_whitespace() {
                let choices = match slot {
                    "PER" => PEOPLE,
                    "LOC" => PLACES,
                    "ORG" => ORGANIZATIONS,
                    word => {
                        words.push(word.to_string());
                        tags.push("O".to_string());
                        continue;
                    }
                };
                let word = choices.choose(&mut rng).copied().unwrap_or(slot);
                words.push(word.to_string());
                tags.push(slot.to_string());
            }
            sentences.push(TaggedSentence { words, tags });
        }
        let mut words = Vocabulary::words();
        for word in sentences.iter().flat_map(|sentence| sentence.words.iter()) {
            words.insert(word);
        }
        let mut tags = Vocabulary::tags();
        for tag in TAGS {
            tags.insert(tag);
        }
        Self {
            sentences,
            words,
            tags,
        }
    }
    /// The sentences.
    pub fn sentences(&self) -> &[TaggedSentence] {
        &self.sentences
    }
    /// The word vocabulary.
    pub fn words(&self) -> &Vocabulary {
        &self.words
    }
    /// The tag vocabulary.
    pub fn tags(&self) -> &Vocabulary {
        &self.tags
    }
}

fn pad(encoded: &[&(Vec<usize>, Vec<usize>)]) -> (Array2<f32>, Array2<usize>) {
    let steps = encoded
        .iter()
        .map(|(word_ids, _)| word_ids.len())
        .max()
        .unwrap_or(0);
    let mut word_ids = Array2::zeros([encoded.len(), steps]);
    let mut tag_ids = Array2::zeros([encoded.len(), steps]);
    for (i, (words, tags)) in encoded.iter().enumerate() {
        for (t, (word, tag)) in words.iter().zip(tags).enumerate() {
            word_ids[[i, t]] = *word as f32;
            tag_ids[[i, t]] = *tag;
        }
    }
    (word_ids, tag_ids)
}

/// Encodes `sentences` into (word ids, tag ids), padded to the longest sentence with id 0.
///
/// Word ids are floats, as expected by [`Embedding`](crate::learn::neural_network::layer::Embedding).
///
/// **Errors**
/// A tag is not in `tags`.
pub fn encode_batch(
    sentences: &[TaggedSentence],
    words: &Vocabulary,
    tags: &Vocabulary,
) -> Result<(Array2<f32>, Array2<usize>)> {
    let encoded = sentences
        .iter()
        .map(|sentence| sentence.encode(words, tags))
        .collect::<Result<Vec<_>>>()?;
    Ok(pad(&encoded.iter().collect::<Vec<_>>()))
}

/// Batches of padded sentences, see [`encode_batch`].
#[derive(Debug)]
pub struct TaggingBatches {
    encoded: Vec<(Vec<usize>, Vec<usize>)>,
    indices: Vec<usize>,
    batch_size: usize,
    position: usize,
    end: usize,
}

impl TaggingBatches {
    /// Encodes `sentences` and batches them with `options`.
    ///
    /// **Errors**
    /// - The batch size is 0.
    /// - A tag is not in `tags`.
    pub fn new(
        sentences: &[TaggedSentence],
        words: &Vocabulary,
        tags: &Vocabulary,
        options: &BatchOptions,
    ) -> Result<Self> {
        ensure!(options.batch_size > 0, "batch_size must be positive!");
        let encoded = sentences
            .iter()
            .map(|sentence| sentence.encode(words, tags))
            .collect::<Result<Vec<_>>>()?;
        let mut indices: Vec<usize> = (0..encoded.len()).collect();
        if options.shuffle {
            let mut rng = match options.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            indices.shuffle(&mut rng);
        }
        let end = if options.drop_last {
            indices.len() - indices.len() % options.batch_size
        } else {
            indices.len()
        };
        Ok(Self {
            encoded,
            indices,
            batch_size: options.batch_size,
            position: 0,
            end,
        })
    }
}

impl Iterator for TaggingBatches {
    type Item = (Array2<f32>, Array2<usize>);
    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let next = (self.position + self.batch_size).min(self.end);
        let batch: Vec<_> = self.indices[self.position..next]
            .iter()
            .map(|i| &self.encoded[*i])
            .collect();
        self.position = next;
        Some(pad(&batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sentence(words: &str, tags: &str) -> TaggedSentence {
        let split = |s: &str| s.split_whitespace().map(String::from).collect();
        TaggedSentence::new(split(words), split(tags)).unwrap()
    }

    #[test]
    fn vocabulary_reserved_ids() {
        let mut words = Vocabulary::words();
        assert_eq!(words.id(PAD), Some(0));
        assert_eq!(words.id(UNK), Some(1));
        assert_eq!(words.insert("rust"), 2);
        assert_eq!(words.insert("rust"), 2);
        assert_eq!(words.encode("go"), Some(1));
        assert_eq!(words.token(2), Some("rust"));
        let tags = Vocabulary::tags();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.encode("PER"), None);
    }

    #[test]
    fn sentence_lengths_must_match() {
        assert!(TaggedSentence::new(vec!["a".into()], vec![]).is_err());
    }

    #[test]
    fn encode_pads_to_longest() {
        let mut words = Vocabulary::words();
        let mut tags = Vocabulary::tags();
        for word in ["alice", "lives", "in", "paris"] {
            words.insert(word);
        }
        for tag in ["O", "PER", "LOC"] {
            tags.insert(tag);
        }
        let sentences = [
            sentence("alice lives in paris", "PER O O LOC"),
            sentence("bob lives", "PER O"),
        ];
        let (x, t) = encode_batch(&sentences, &words, &tags).unwrap();
        assert_eq!(x, array![[2., 3., 4., 5.], [1., 3., 0., 0.]]);
        assert_eq!(t, array![[2, 1, 1, 3], [2, 1, 0, 0]]);
        let unknown_tag = [sentence("alice", "MISC")];
        assert!(encode_batch(&unknown_tag, &words, &tags).is_err());
    }

    #[test]
    fn synthetic_corpus() {
        let corpus = SyntheticCorpus::generate(50, 0);
        assert_eq!(corpus.sentences().len(), 50);
        assert_eq!(
            SyntheticCorpus::generate(50, 0).sentences(),
            corpus.sentences()
        );
        assert_eq!(corpus.tags().len(), 5);
        for sentence in corpus.sentences() {
            assert_eq!(sentence.words().len(), sentence.tags().len());
            for (word, tag) in sentence.words().iter().zip(sentence.tags()) {
                assert!(corpus.words().id(word).is_some());
                if PEOPLE.contains(&word.as_str()) {
                    assert_eq!(tag, "PER");
                }
            }
        }
    }

    #[test]
    fn tagging_batches() {
        let corpus = SyntheticCorpus::generate(10, 1);
        let options = BatchOptions {
            batch_size: 4,
            drop_last: true,
            ..BatchOptions::default()
        };
        let batches: Vec<_> =
            TaggingBatches::new(corpus.sentences(), corpus.words(), corpus.tags(), &options)
                .unwrap()
                .collect();
        assert_eq!(batches.len(), 2);
        for (x, t) in batches {
            assert_eq!(x.dim(), t.dim());
            assert_eq!(x.nrows(), 4);
            for (x, t) in x.iter().zip(t.iter()) {
                assert_eq!(*x == 0., *t == 0);
            }
        }
    }
}

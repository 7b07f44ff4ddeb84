use super::idx::{read_gz_images, read_gz_labels};
use crate::result::Result;
use anyhow::{bail, Context};
use curl::easy::Easy;
use derive_more::Display;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array4, Axis};
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

/// The kind of Mnist.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum MnistKind {
    /// [MNIST](<http://yann.lecun.com/exdb/mnist/>)
    #[display(fmt = "mnist")]
    Digits,
    /// [FashionMNIST](<https://github.com/zalandoresearch/fashion-mnist>)
    #[display(fmt = "fashion-mnist")]
    Fashion,
}

impl MnistKind {
    /// The url the files are downloaded from.
    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Digits => "https://storage.googleapis.com/cvdf-datasets/mnist/",
            Self::Fashion => "http://fashion-mnist.s3-website.eu-central-1.amazonaws.com/",
        }
    }
}

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Mnist builder.
pub mod builders {
    use super::{Mnist, MnistKind, Result};
    use std::path::Path;

    /// Mnist builder.
    #[derive(Debug)]
    pub struct MnistBuilder<'a> {
        pub(super) path: Option<&'a Path>,
        pub(super) kind: MnistKind,
        pub(super) download: bool,
    }

    impl Default for MnistBuilder<'_> {
        fn default() -> Self {
            Self {
                path: None,
                kind: MnistKind::Digits,
                download: false,
            }
        }
    }

    impl<'a> MnistBuilder<'a> {
        /// The path to load the dataset from.
        ///
        /// The files are downloaded to / loaded from "`path`/`kind`". Defaults to "data".
        pub fn path(self, path: &Path) -> MnistBuilder {
            MnistBuilder {
                path: Some(path),
                kind: self.kind,
                download: self.download,
            }
        }
        /// The kind of Mnist to use. Defaults to [`MnistKind::Digits`] (ie the original MNIST dataset).
        pub fn kind(self, kind: MnistKind) -> Self {
            Self { kind, ..self }
        }
        /// Whether to download missing files. Defaults to false.
        pub fn download(self, download: bool) -> Self {
            Self { download, ..self }
        }
        /// Builds the dataset.
        ///
        /// **Errors**
        /// - The files were not found and `download` is false.
        /// - The download failed.
        /// - Decompressing / parsing the data failed.
        pub fn build(&self) -> Result<Mnist> {
            Mnist::build(self)
        }
    }
}
use builders::MnistBuilder;

/// The MNIST dataset.
///
/// 60_000 training and 10_000 testing images, 28 x 28 pixels, with 10 classes.
#[derive(Clone, Debug)]
pub struct Mnist {
    kind: MnistKind,
    train_images: Array4<u8>,
    train_classes: Array1<u8>,
    test_images: Array4<u8>,
    test_classes: Array1<u8>,
}

impl Mnist {
    /// Returns an [`MnistBuilder`] used to specify options.
    /**
    ```no_run
    # use gradnotes::{
    #    result::Result,
    #    dataset::mnist::{Mnist, MnistKind},
    # };
    # use std::path::Path;
    # fn main() -> Result<()> {
    let mnist = Mnist::builder()
        .path(Path::new("data"))
        .kind(MnistKind::Fashion)
        .download(true)
        .build()?;
    # Ok(())
    # }
    ```
    */
    pub fn builder() -> MnistBuilder<'static> {
        MnistBuilder::default()
    }
    fn build(builder: &MnistBuilder) -> Result<Self> {
        let mnist_path = builder
            .path
            .unwrap_or_else(|| Path::new("data"))
            .join(builder.kind.to_string());
        let mut paths = Vec::with_capacity(4);
        for name in [TRAIN_IMAGES, TRAIN_LABELS, TEST_IMAGES, TEST_LABELS] {
            let path = mnist_path.join(name).with_extension("gz");
            if path.exists() {
                log::info!("using cached {path:?}");
            } else if builder.download {
                fs::create_dir_all(&mnist_path)?;
                let url = format!("{}{name}.gz", builder.kind.base_url());
                download(&url, &path).with_context(|| format!("failed to download {url}"))?;
            } else {
                bail!("{path:?} not found, enable download to fetch it!");
            }
            paths.push(path);
        }
        let images = |path: &PathBuf| -> Result<Array4<u8>> {
            let images = read_gz_images(path).with_context(|| format!("failed to load {path:?}"))?;
            Ok(images.insert_axis(Axis(1)))
        };
        let classes = |path: &PathBuf| -> Result<Array1<u8>> {
            read_gz_labels(path).with_context(|| format!("failed to load {path:?}"))
        };
        let mnist = Self {
            kind: builder.kind,
            train_images: images(&paths[0])?,
            train_classes: classes(&paths[1])?,
            test_images: images(&paths[2])?,
            test_classes: classes(&paths[3])?,
        };
        for (images, classes) in [
            (&mnist.train_images, &mnist.train_classes),
            (&mnist.test_images, &mnist.test_classes),
        ] {
            if images.len_of(Axis(0)) != classes.len() {
                bail!(
                    "{} images but {} classes!",
                    images.len_of(Axis(0)),
                    classes.len()
                );
            }
        }
        Ok(mnist)
    }
    /// The kind.
    pub fn kind(&self) -> MnistKind {
        self.kind
    }
    /// The training images.
    ///
    /// Shape = \[60_000, 1, 28, 28\].
    pub fn train_images(&self) -> &Array4<u8> {
        &self.train_images
    }
    /// The training classes.
    ///
    /// Shape = \[60_000\]. The classes range from 0 to 9 inclusive.
    pub fn train_classes(&self) -> &Array1<u8> {
        &self.train_classes
    }
    /// The testing images.
    ///
    /// Shape = \[10_000, 1, 28, 28\].
    pub fn test_images(&self) -> &Array4<u8> {
        &self.test_images
    }
    /// The testing classes.
    ///
    /// Shape = \[10_000\].
    pub fn test_classes(&self) -> &Array1<u8> {
        &self.test_classes
    }
}

/// Downloads `url` to `path`.
///
/// Writes to "`path`.part" and renames it on success, so that a partial download is not
/// mistaken for a cached file.
fn download(url: &str, path: &Path) -> Result<()> {
    log::info!("downloading {url}");
    let part_path = path.with_extension("gz.part");
    let mut file = File::create(&part_path)?;
    let style = ProgressStyle::default_bar()
        .template("{msg} [{bar:40}] {bytes}/{total_bytes} [eta: {eta}]")?
        .progress_chars("=> ");
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bar = ProgressBar::new(0).with_style(style).with_message(file_name);
    let mut easy = Easy::new();
    easy.url(url)?;
    easy.follow_location(true)?;
    easy.fail_on_error(false)?;
    easy.progress(true)?;
    let mut write_error = None;
    let performed = {
        let mut transfer = easy.transfer();
        transfer.write_function(|data| match file.write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                write_error.replace(e);
                // a short write aborts the transfer
                Ok(0)
            }
        })?;
        transfer.progress_function(|total, downloaded, _, _| {
            bar.set_length(total as u64);
            bar.set_position(downloaded as u64);
            true
        })?;
        transfer.perform()
    };
    if let Some(e) = write_error {
        return Err(e.into());
    }
    performed?;
    bar.finish();
    let status = easy.response_code()?;
    if status != 200 {
        fs::remove_file(&part_path)?;
        bail!("GET {url} returned status {status}!");
    }
    file.flush()?;
    std::mem::drop(file);
    fs::rename(&part_path, path)?;
    log::info!("saved {path:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    fn write_gz(path: &Path, magic: u32, dims: &[u32], payload: &[u8]) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::fast());
        encoder.write_all(&magic.to_be_bytes()).unwrap();
        for dim in dims {
            encoder.write_all(&dim.to_be_bytes()).unwrap();
        }
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn mnist_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mnist_path = dir.path().join("mnist");
        fs::create_dir_all(&mnist_path).unwrap();
        let file = |name: &str| mnist_path.join(name).with_extension("gz");
        write_gz(&file(TRAIN_IMAGES), 0x0803, &[3, 2, 2], &[255; 12]);
        write_gz(&file(TRAIN_LABELS), 0x0801, &[3], &[1, 2, 3]);
        write_gz(&file(TEST_IMAGES), 0x0803, &[1, 2, 2], &[0; 4]);
        write_gz(&file(TEST_LABELS), 0x0801, &[1], &[9]);
        let mnist = Mnist::builder().path(dir.path()).build().unwrap();
        assert_eq!(mnist.kind(), MnistKind::Digits);
        assert_eq!(mnist.train_images().shape(), &[3, 1, 2, 2]);
        assert_eq!(mnist.train_classes().to_vec(), vec![1, 2, 3]);
        assert_eq!(mnist.test_images().shape(), &[1, 1, 2, 2]);
        assert_eq!(mnist.test_classes()[0], 9);
    }

    #[test]
    fn mnist_missing_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let error = Mnist::builder()
            .path(dir.path())
            .kind(MnistKind::Fashion)
            .build()
            .unwrap_err();
        assert!(error.to_string().contains("fashion-mnist"));
    }
}

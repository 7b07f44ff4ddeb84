//! IDX is the format of the MNIST files: a big endian header followed by the raw data.
//!
//! The header is a magic number followed by one u32 per dimension. The magic number is
//! `0x0000TTNN`, where `TT` is the data type (only `0x08`, unsigned bytes, is supported) and `NN`
//! is the number of dimensions.
use crate::result::Result;
use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::GzDecoder;
use ndarray::{Array1, Array3};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

/// The data type of u8 IDX files.
pub const IDX_U8: u8 = 0x08;

/// Errors parsing IDX data.
#[derive(Debug, thiserror::Error)]
pub enum IdxError {
    /// The magic number does not describe u8 data with the expected number of dimensions.
    #[error("invalid IDX magic {magic:#010x}, expected u8 data with {ndims} dimensions")]
    Magic {
        /// The magic number.
        magic: u32,
        /// The expected number of dimensions.
        ndims: usize,
    },
    /// The payload is shorter than the header declares.
    #[error("truncated IDX payload, expected {expected} bytes found {found}")]
    Truncated {
        /// The length declared by the header.
        expected: usize,
        /// The length read.
        found: usize,
    },
    /// The payload is longer than the header declares.
    #[error("IDX payload has trailing bytes after {0} expected bytes")]
    TrailingBytes(usize),
    /// The dimensions overflow the payload length.
    #[error("IDX dimensions {0:?} overflow the payload length")]
    Overflow(Vec<usize>),
    /// Failed to read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The payload could not be reshaped.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// An IDX header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IdxHeader {
    /// The magic number.
    pub magic: u32,
    /// The dimensions.
    pub dims: Vec<usize>,
}

impl IdxHeader {
    /// Reads a header with `ndims` dimensions.
    pub fn read<R: Read>(mut reader: R, ndims: usize) -> Result<Self, IdxError> {
        let magic = reader.read_u32::<BigEndian>()?;
        let [zero_hi, zero_lo, dtype, n] = magic.to_be_bytes();
        if zero_hi != 0 || zero_lo != 0 || dtype != IDX_U8 || n as usize != ndims {
            return Err(IdxError::Magic { magic, ndims });
        }
        let dims = (0..ndims)
            .map(|_| Ok(reader.read_u32::<BigEndian>()? as usize))
            .collect::<Result<_, IdxError>>()?;
        Ok(Self { magic, dims })
    }
    /// The number of elements in the payload.
    ///
    /// **Errors**
    /// The product of the dimensions overflows.
    pub fn len(&self) -> Result<usize, IdxError> {
        self.dims
            .iter()
            .try_fold(1usize, |len, dim| len.checked_mul(*dim))
            .ok_or_else(|| IdxError::Overflow(self.dims.clone()))
    }
    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }
}

fn read_payload<R: Read>(reader: R, header: &IdxHeader) -> Result<Vec<u8>, IdxError> {
    let expected = header.len()?;
    let limit = u64::try_from(expected)
        .ok()
        .and_then(|expected| expected.checked_add(1))
        .ok_or_else(|| IdxError::Overflow(header.dims.clone()))?;
    // one extra byte detects trailing data without reading all of it
    let mut data = Vec::new();
    reader.take(limit).read_to_end(&mut data)?;
    match data.len() {
        found if found < expected => Err(IdxError::Truncated { expected, found }),
        found if found > expected => Err(IdxError::TrailingBytes(expected)),
        _ => Ok(data),
    }
}

/// Reads images (count, rows, columns).
pub fn read_images<R: Read>(mut reader: R) -> Result<Array3<u8>, IdxError> {
    let header = IdxHeader::read(&mut reader, 3)?;
    let data = read_payload(reader, &header)?;
    let [count, rows, columns] = [header.dims[0], header.dims[1], header.dims[2]];
    Ok(Array3::from_shape_vec([count, rows, columns], data)?)
}

/// Reads labels (count).
pub fn read_labels<R: Read>(mut reader: R) -> Result<Array1<u8>, IdxError> {
    let header = IdxHeader::read(&mut reader, 1)?;
    let data = read_payload(reader, &header)?;
    Ok(Array1::from(data))
}

fn gz_reader(path: &Path) -> Result<GzDecoder<BufReader<File>>, IdxError> {
    Ok(GzDecoder::new(BufReader::new(File::open(path)?)))
}

/// Reads gzipped images, see [`read_images`].
pub fn read_gz_images(path: impl AsRef<Path>) -> Result<Array3<u8>, IdxError> {
    read_images(gz_reader(path.as_ref())?)
}

/// Reads gzipped labels, see [`read_labels`].
pub fn read_gz_labels(path: impl AsRef<Path>) -> Result<Array1<u8>, IdxError> {
    read_labels(gz_reader(path.as_ref())?)
}

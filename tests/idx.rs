use byteorder::{BigEndian, WriteBytesExt};
use flate2::{write::GzEncoder, Compression};
use gradnotes::dataset::{
    batches,
    idx::{read_gz_images, read_gz_labels, IdxError},
    scale_images, BatchOptions,
};
use ndarray::Axis;
use std::{fs::File, io::Write, path::Path};

fn write_idx(path: &Path, magic: u32, dims: &[u32], payload: &[u8]) {
    let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    encoder.write_u32::<BigEndian>(magic).unwrap();
    for dim in dims {
        encoder.write_u32::<BigEndian>(*dim).unwrap();
    }
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn gz_images_scale_and_batch() {
    let dir = tempfile::tempdir().unwrap();
    let images_path = dir.path().join("images.gz");
    let labels_path = dir.path().join("labels.gz");
    let (count, rows, columns) = (7, 4, 3);
    let payload: Vec<u8> = (0..count * rows * columns)
        .map(|i| (i * 37 % 256) as u8)
        .collect();
    write_idx(
        &images_path,
        0x0803,
        &[count as u32, rows as u32, columns as u32],
        &payload,
    );
    let labels: Vec<u8> = (0..count).map(|i| (i % 10) as u8).collect();
    write_idx(&labels_path, 0x0801, &[count as u32], &labels);

    let images = read_gz_images(&images_path).unwrap();
    assert_eq!(images.dim(), (count, rows, columns));
    assert_eq!(images.len(), payload.len());
    assert_eq!(images.iter().copied().collect::<Vec<_>>(), payload);
    let classes = read_gz_labels(&labels_path).unwrap();
    assert_eq!(classes.to_vec(), labels);

    let x = scale_images(&images.insert_axis(Axis(1)));
    assert!(x.iter().all(|x| (0. ..=1.).contains(x)));
    let options = BatchOptions {
        batch_size: 3,
        drop_last: true,
        ..BatchOptions::default()
    };
    let batches: Vec<_> = batches(&x, &classes, &options).unwrap().collect();
    assert_eq!(batches.len(), 2);
    for (x, t) in batches {
        assert_eq!(x.shape(), &[3, 1, rows, columns]);
        assert_eq!(t.len(), 3);
    }
}

#[test]
fn gz_truncated_payload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("images.gz");
    write_idx(&path, 0x0803, &[2, 2, 2], &[0; 7]);
    let error = read_gz_images(&path).unwrap_err();
    assert!(matches!(
        error,
        IdxError::Truncated {
            expected: 8,
            found: 7
        }
    ));
    assert!(error.to_string().contains("truncated"));
}

#[test]
fn gz_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = read_gz_labels(dir.path().join("missing.gz"));
    assert!(matches!(result, Err(IdxError::Io(_))));
}

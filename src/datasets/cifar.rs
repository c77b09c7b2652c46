use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::transforms::{Normalize, PadCrop, RandomFlip};
use super::{DataFormat, DatasetBuilder, InMemoryImages};

const IMAGE_SIDE: usize = 32;
const CHANNELS: usize = 3;
/// label byte followed by the three 32x32 colour planes
const RECORD_LEN: usize = 1 + IMAGE_SIDE * IMAGE_SIDE * CHANNELS;
const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";
/// pixels of zero padding before the random training crop
const CROP_PADDING: usize = 4;

/// A struct containing image data, where all images are are the same size
/// and stored contiguously next to each other, channels last
struct ContiguousStaticImage {
    images: Vec<f32>,
    labels: Vec<u32>,
}

impl ContiguousStaticImage {
    fn new() -> Self {
        Self { images: Vec::new(), labels: Vec::new() }
    }

    /// Appends every record of a CIFAR-10 binary file, the planes are stored
    /// channel-major in the file and are interleaved to channels last here
    fn push_records(&mut self, raw_buf: &[u8]) -> Result<()> {
        if raw_buf.len() % RECORD_LEN != 0 {
            return Err(Error::msg(format!(
                "file length {} is not a multiple of the {} byte record",
                raw_buf.len(),
                RECORD_LEN
            )));
        }
        let plane = IMAGE_SIDE * IMAGE_SIDE;
        self.images.reserve(raw_buf.len() / RECORD_LEN * plane * CHANNELS);
        for record in raw_buf.chunks_exact(RECORD_LEN) {
            self.labels.push(record[0] as u32);
            let pixels = &record[1..];
            let iter = (0..plane)
                .flat_map(|j| (0..CHANNELS).map(move |k| pixels[j + k * plane] as f32 / 255.0));
            self.images.extend(iter);
        }
        Ok(())
    }

    fn into_dataset(self, batch_size: usize) -> Result<InMemoryImages> {
        let n = self.labels.len();
        let images = Array4::from_shape_vec((n, IMAGE_SIDE, IMAGE_SIDE, CHANNELS), self.images)
            .context("cifar images do not fill a [N, 32, 32, 3] array")?;
        InMemoryImages::new(images, self.labels, batch_size)
    }
}

/// main parameters driving the cifar10 dataset
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Cifar10Params {
    /// directory holding the binary version of the dataset
    pub path: PathBuf,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub data_format: DataFormat,
    pub seed: u64,
}

impl Cifar10Params {
    fn read(&self, files: &[&str]) -> Result<ContiguousStaticImage> {
        let mut data = ContiguousStaticImage::new();
        for file in files {
            let path = self.path.join(file);
            let raw_buf = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            data.push_records(&raw_buf)
                .with_context(|| format!("parsing {}", path.display()))?;
        }
        Ok(data)
    }
}

impl DatasetBuilder for Cifar10Params {
    type Dataset = InMemoryImages;

    fn build_train(&self) -> Result<Self::Dataset> {
        if self.batch_size == 0 {
            return Err(Error::msg("batch size cannot be zero"));
        }
        let data = self.read(&TRAIN_FILES)?;
        info!(examples = data.labels.len(), path = %self.path.display(), "loaded cifar10 train split");
        Ok(data
            .into_dataset(self.batch_size)?
            .with_buffer_size(self.buffer_size)
            .with_data_format(self.data_format)
            .with_seed(self.seed)
            .with_transform(Box::new(Normalize::default()))
            .with_transform(Box::new(PadCrop::new(CROP_PADDING, self.seed.wrapping_add(1))))
            .with_transform(Box::new(RandomFlip::new(self.seed.wrapping_add(2)))))
    }

    fn build_test(&self) -> Option<Result<Self::Dataset>> {
        if self.batch_size == 0 {
            return Some(Err(Error::msg("batch size cannot be zero")));
        }
        let build = || -> Result<InMemoryImages> {
            let data = self.read(&[TEST_FILE])?;
            info!(examples = data.labels.len(), path = %self.path.display(), "loaded cifar10 test split");
            Ok(data
                .into_dataset(self.batch_size)?
                .with_data_format(self.data_format)
                .with_transform(Box::new(Normalize::default())))
        };
        Some(build())
    }
}

#[cfg(test)]
fn fake_record(label: u8, fill: impl Fn(usize, usize) -> u8) -> Vec<u8> {
    let plane = IMAGE_SIDE * IMAGE_SIDE;
    let mut rec = vec![label];
    for k in 0..CHANNELS {
        for j in 0..plane {
            rec.push(fill(j, k));
        }
    }
    rec
}

#[test]
fn test_push_records_interleaves_channels() {
    let mut data = ContiguousStaticImage::new();
    let mut raw = fake_record(7, |j, k| if j == 1 { 51 * k as u8 } else { 0 });
    raw.extend(fake_record(2, |_, _| 255));
    data.push_records(&raw).unwrap();
    assert_eq!(data.labels, vec![7, 2]);

    let ds = data.into_dataset(1).unwrap();
    let [h, w, c] = ds.image_shape();
    assert_eq!((h, w, c), (32, 32, 3));
    assert_eq!(ds.images[[0, 0, 1, 2]], 102.0 / 255.0);
    assert_eq!(ds.images[[1, 31, 31, 0]], 1.0);
}

#[test]
fn test_push_records_rejects_truncated() {
    let mut data = ContiguousStaticImage::new();
    assert!(data.push_records(&[0u8; RECORD_LEN + 3]).is_err());
}

#[test]
fn test_build_from_directory() {
    use super::Dataset;
    let dir = tempfile::tempdir().unwrap();
    for (i, file) in TRAIN_FILES.iter().enumerate() {
        let raw: Vec<u8> = (0..3).flat_map(|_| fake_record(i as u8, |_, _| 128)).collect();
        fs::write(dir.path().join(file), raw).unwrap();
    }
    fs::write(dir.path().join(TEST_FILE), fake_record(1, |_, _| 0)).unwrap();

    let params = Cifar10Params { path: dir.path().to_path_buf(), batch_size: 4, buffer_size: 8, ..Default::default() };
    let mut train = params.build_train().unwrap();
    assert_eq!(train.num_examples(), 15);
    assert_eq!(train.steps_per_epoch(), 3);
    train.shuffle();
    let batch = train.next().unwrap();
    assert_eq!(batch.images.dim(), (4, 32, 32, 3));

    let test = params.build_test().unwrap().unwrap();
    assert_eq!(test.num_examples(), 1);
}

#[test]
fn test_missing_directory_is_error() {
    let params = Cifar10Params { path: "/nonexistent/cifar".into(), batch_size: 4, ..Default::default() };
    assert!(params.build_train().is_err());
    assert!(params.build_test().unwrap().is_err());
}

//! This module only defines the dataset logic for loading and processing datasets,
//! the training loop consumes them through `Cursor`.
use anyhow::{Error, Result};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

pub mod cifar;
pub mod data;
pub mod synthetic;
pub mod transforms;

pub use data::{Batch, DataFormat};

pub trait DatasetBuilder {
    type Dataset: Dataset;
    fn build_train(&self) -> Result<Self::Dataset>;
    fn build_test(&self) -> Option<Result<Self::Dataset>>;
}

/// The universal Dataset trait, which is the final object
/// passed to the model for training
pub trait Dataset: Send {
    type DataPoint;
    fn next(&mut self) -> Option<Self::DataPoint>;
    fn reset(&mut self);
    fn shuffle(&mut self);
    /// number of examples in the partition, not the number of batches
    fn num_examples(&self) -> usize;
    fn batch_size(&self) -> usize;
}

pub trait Transform<In, Out> {
    fn transform(&mut self, x: In) -> Out;
}

pub type BatchTransform = Box<dyn Transform<Batch, Batch> + Send>;

/// The order produced by streaming `0..n` through a shuffle buffer of
/// `buffer_size` slots: fill the buffer, emit a random slot, refill it with the
/// next element. A buffer covering the whole dataset is a uniform shuffle,
/// a buffer of one keeps the original order.
pub fn buffered_permutation<R: Rng + ?Sized>(n: usize, buffer_size: usize, rng: &mut R) -> Vec<usize> {
    let buffer_size = buffer_size.max(1);
    let mut buffer: Vec<usize> = Vec::with_capacity(buffer_size.min(n));
    let mut source = 0..n;
    let mut order = Vec::with_capacity(n);

    for i in source.by_ref().take(buffer_size) {
        buffer.push(i);
    }
    while !buffer.is_empty() {
        let slot = rng.gen_range(0..buffer.len());
        match source.next() {
            Some(next) => order.push(std::mem::replace(&mut buffer[slot], next)),
            None => order.push(buffer.swap_remove(slot)),
        }
    }
    order
}

/// Images held contiguously in memory as a channels-last [N, H, W, C] array.
/// Batches are assembled by gathering along the shuffled order, passed through
/// the transforms and finally converted to the requested `DataFormat`.
pub struct InMemoryImages {
    images: Array4<f32>,
    labels: Vec<u32>,
    order: Vec<usize>,
    idx: usize,
    batch_size: usize,
    buffer_size: usize,
    data_format: DataFormat,
    transforms: Vec<BatchTransform>,
    rng: StdRng,
}

impl InMemoryImages {
    pub fn new(images: Array4<f32>, labels: Vec<u32>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::msg("batch size cannot be zero"));
        }
        if images.len_of(Axis(0)) != labels.len() {
            return Err(Error::msg(format!(
                "{} images but {} labels",
                images.len_of(Axis(0)),
                labels.len()
            )));
        }
        let order = (0..labels.len()).collect();
        Ok(Self {
            images,
            labels,
            order,
            idx: 0,
            batch_size,
            buffer_size: usize::MAX,
            data_format: DataFormat::ChannelsLast,
            transforms: Vec::new(),
            rng: StdRng::seed_from_u64(0),
        })
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_data_format(mut self, data_format: DataFormat) -> Self {
        self.data_format = data_format;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_transform(mut self, transform: BatchTransform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// (height, width, channels) of a single image
    pub fn image_shape(&self) -> [usize; 3] {
        let (_, h, w, c) = self.images.dim();
        [h, w, c]
    }

    /// full batches per pass over the partition
    pub fn steps_per_epoch(&self) -> usize {
        self.labels.len() / self.batch_size
    }
}

impl Dataset for InMemoryImages {
    type DataPoint = Batch;

    fn next(&mut self) -> Option<Batch> {
        // only full batches are emitted
        if self.idx + self.batch_size > self.order.len() {
            return None;
        }
        let indices = &self.order[self.idx..self.idx + self.batch_size];
        let images = self.images.select(Axis(0), indices);
        let labels = indices.iter().map(|i| self.labels[*i]).collect();
        self.idx += self.batch_size;

        let mut batch = Batch { images, labels };
        for t in self.transforms.iter_mut() {
            batch = t.transform(batch);
        }
        if self.data_format == DataFormat::ChannelsFirst {
            batch.images = batch
                .images
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned();
        }
        Some(batch)
    }

    fn reset(&mut self) {
        self.idx = 0;
    }

    fn shuffle(&mut self) {
        self.order = buffered_permutation(self.labels.len(), self.buffer_size, &mut self.rng);
    }

    fn num_examples(&self) -> usize {
        self.labels.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// A resettable position into a partition. `initialize` rewinds the cursor
/// (and reshuffles it, for training partitions) at the start of every epoch.
pub struct Cursor<D: Dataset> {
    dataset: D,
    name: &'static str,
    reshuffle: bool,
    consumed: usize,
}

impl<D: Dataset> Cursor<D> {
    pub fn new(dataset: D, name: &'static str, reshuffle: bool) -> Self {
        Self { dataset, name, reshuffle, consumed: 0 }
    }

    pub fn initialize(&mut self) {
        self.dataset.reset();
        if self.reshuffle {
            self.dataset.shuffle();
        }
        self.consumed = 0;
        debug!(partition = self.name, "cursor initialized");
    }

    /// The next batch; running out of data is an error, as the caller
    /// asked for a fixed number of steps
    pub fn next_batch(&mut self) -> Result<D::DataPoint> {
        match self.dataset.next() {
            Some(x) => {
                self.consumed += 1;
                Ok(x)
            }
            None => Err(Error::msg(format!(
                "{} partition exhausted after {} batches",
                self.name, self.consumed
            ))),
        }
    }
}

#[cfg(test)]
fn labelled(n: usize, batch_size: usize) -> InMemoryImages {
    let images = Array4::from_shape_fn((n, 2, 2, 1), |(i, _, _, _)| i as f32);
    InMemoryImages::new(images, (0..n as u32).collect(), batch_size).unwrap()
}

#[test]
fn test_buffered_permutation_is_permutation() {
    let mut rng = StdRng::seed_from_u64(5);
    for buffer in [1, 3, 10, 100] {
        let mut order = buffered_permutation(37, buffer, &mut rng);
        order.sort_unstable();
        assert_eq!(order, (0..37).collect::<Vec<_>>());
    }
    assert_eq!(buffered_permutation(6, 1, &mut rng), vec![0, 1, 2, 3, 4, 5]);
    assert!(buffered_permutation(0, 4, &mut rng).is_empty());
}

#[test]
fn test_buffered_permutation_window() {
    // an element can never be emitted before the buffer has reached it
    let mut rng = StdRng::seed_from_u64(9);
    let order = buffered_permutation(50, 4, &mut rng);
    for (pos, i) in order.iter().enumerate() {
        assert!(*i <= pos + 3, "element {i} emitted at {pos}");
    }
}

#[test]
fn test_in_memory_full_batches_only() {
    let mut data = labelled(5, 2);
    assert_eq!(data.steps_per_epoch(), 2);
    assert_eq!(data.next().unwrap().labels, vec![0, 1]);
    assert_eq!(data.next().unwrap().labels, vec![2, 3]);
    assert!(data.next().is_none());
    data.reset();
    assert_eq!(data.next().unwrap().labels, vec![0, 1]);
}

#[test]
fn test_in_memory_exact_fit() {
    let mut data = labelled(2, 2);
    let batch = data.next().unwrap();
    assert_eq!(batch.len(), 2);
    assert!(data.next().is_none());
}

#[test]
fn test_in_memory_channels_first() {
    let images = Array4::from_shape_fn((2, 3, 4, 2), |(_, h, w, c)| (h * 10 + w + 100 * c) as f32);
    let mut data = InMemoryImages::new(images, vec![0, 1], 2)
        .unwrap()
        .with_data_format(DataFormat::ChannelsFirst);
    let batch = data.next().unwrap();
    assert_eq!(batch.images.dim(), (2, 2, 3, 4));
    assert_eq!(batch.images[[0, 1, 2, 3]], 123.0);
}

#[test]
fn test_cursor_exhaustion_is_error() {
    let mut cursor = Cursor::new(labelled(4, 2), "train", true);
    cursor.initialize();
    cursor.next_batch().unwrap();
    cursor.next_batch().unwrap();
    assert!(cursor.next_batch().is_err());
    cursor.initialize();
    let batch = cursor.next_batch().unwrap();
    // labels still match images after a reshuffle
    for (n, l) in batch.labels.iter().enumerate() {
        assert_eq!(batch.images[[n, 0, 0, 0]], *l as f32);
    }
}

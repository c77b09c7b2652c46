use anyhow::{Error, Result};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{DataFormat, DatasetBuilder, InMemoryImages};

/// Randomly generated, learnable image classification data. Every class owns
/// a fixed prototype image and each example is its class prototype plus noise.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyntheticParams {
    pub train_examples: usize,
    pub test_examples: usize,
    /// (height, width, channels)
    pub image_shape: [usize; 3],
    pub classes: usize,
    pub noise: f32,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub data_format: DataFormat,
    pub seed: u64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            train_examples: 512,
            test_examples: 128,
            image_shape: [32, 32, 3],
            classes: 10,
            noise: 0.5,
            batch_size: 64,
            buffer_size: 512,
            data_format: DataFormat::ChannelsLast,
            seed: 42,
        }
    }
}

impl SyntheticParams {
    fn prototypes(&self) -> Array4<f32> {
        let [h, w, c] = self.image_shape;
        let mut rng = StdRng::seed_from_u64(self.seed);
        Array4::random_using((self.classes, h, w, c), StandardNormal, &mut rng)
    }

    fn generate(&self, n: usize, stream: u64) -> Result<InMemoryImages> {
        if self.batch_size == 0 {
            return Err(Error::msg("batch size cannot be zero"));
        }
        if self.classes == 0 {
            return Err(Error::msg("synthetic data needs at least one class"));
        }
        let [h, w, c] = self.image_shape;
        let prototypes = self.prototypes();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(stream));

        let labels: Vec<u32> = (0..n).map(|i| (i % self.classes) as u32).collect();
        let mut images = Array4::<f32>::random_using((n, h, w, c), StandardNormal, &mut rng) * self.noise;
        for (mut im, label) in images.axis_iter_mut(Axis(0)).zip(labels.iter()) {
            im += &prototypes.index_axis(Axis(0), *label as usize);
        }

        Ok(InMemoryImages::new(images, labels, self.batch_size)?
            .with_buffer_size(self.buffer_size)
            .with_data_format(self.data_format)
            .with_seed(self.seed.wrapping_add(stream)))
    }
}

impl DatasetBuilder for SyntheticParams {
    type Dataset = InMemoryImages;

    fn build_train(&self) -> Result<Self::Dataset> {
        self.generate(self.train_examples, 1)
    }

    fn build_test(&self) -> Option<Result<Self::Dataset>> {
        Some(self.generate(self.test_examples, 2))
    }
}

#[test]
fn test_synthetic_shapes_and_labels() {
    use super::Dataset;
    let params = SyntheticParams {
        train_examples: 6,
        test_examples: 2,
        image_shape: [4, 4, 3],
        classes: 3,
        batch_size: 2,
        ..Default::default()
    };
    let mut train = params.build_train().unwrap();
    assert_eq!(train.num_examples(), 6);
    assert_eq!(train.image_shape(), [4, 4, 3]);
    let batch = train.next().unwrap();
    assert_eq!(batch.labels, vec![0, 1]);
    assert!(batch.images.iter().all(|x| x.is_finite()));

    let test = params.build_test().unwrap().unwrap();
    assert_eq!(test.steps_per_epoch(), 1);
}

#[test]
fn test_synthetic_is_deterministic() {
    use super::Dataset;
    let params = SyntheticParams { train_examples: 4, batch_size: 4, image_shape: [2, 2, 1], ..Default::default() };
    let a = params.build_train().unwrap().next().unwrap();
    let b = params.build_train().unwrap().next().unwrap();
    assert_eq!(a.images, b.images);
}

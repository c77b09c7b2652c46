use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::data::Batch;
use super::Transform;

/// Per-channel mean of the CIFAR-10 training images, in [0, 1] pixel units
pub const CIFAR_MEAN: [f32; 3] = [0.49139968, 0.48215841, 0.44653091];
/// Per-channel standard deviation of the CIFAR-10 training images
pub const CIFAR_STD: [f32; 3] = [0.24703223, 0.24348513, 0.26158784];

/// `(x - mean[c]) / std[c]` on a channels-last batch
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for Normalize {
    fn default() -> Self {
        Normalize {
            mean: CIFAR_MEAN.to_vec(),
            std: CIFAR_STD.to_vec(),
        }
    }
}

impl Transform<Batch, Batch> for Normalize {
    fn transform(&mut self, mut data: Batch) -> Batch {
        for (c, mut channel) in data.images.axis_iter_mut(Axis(3)).enumerate() {
            if let (Some(mean), Some(std)) = (self.mean.get(c), self.std.get(c)) {
                channel.mapv_inplace(|x| (x - mean) / std);
            }
        }
        data
    }
}

/// Mirrors each channels-last image left to right with probability 1/2
pub struct RandomFlip {
    rng: StdRng,
}

impl RandomFlip {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl Transform<Batch, Batch> for RandomFlip {
    fn transform(&mut self, mut data: Batch) -> Batch {
        for mut im in data.images.axis_iter_mut(Axis(0)) {
            if self.rng.gen_bool(0.5) {
                let flipped = im.slice(s![.., ..;-1, ..]).to_owned();
                im.assign(&flipped);
            }
        }
        data
    }
}

/// Zero-pads each channels-last image by `pad` pixels on every side and takes
/// a random crop of the original size
pub struct PadCrop {
    pad: usize,
    rng: StdRng,
}

impl PadCrop {
    pub fn new(pad: usize, seed: u64) -> Self {
        Self { pad, rng: StdRng::seed_from_u64(seed) }
    }
}

impl Transform<Batch, Batch> for PadCrop {
    fn transform(&mut self, mut data: Batch) -> Batch {
        if self.pad == 0 {
            return data;
        }
        let (_, h, w, _) = data.images.dim();
        let pad = self.pad as isize;
        for mut im in data.images.axis_iter_mut(Axis(0)) {
            let dy = self.rng.gen_range(-pad..=pad);
            let dx = self.rng.gen_range(-pad..=pad);
            let src = im.to_owned();
            for ((y, x, c), v) in im.indexed_iter_mut() {
                let sy = y as isize + dy;
                let sx = x as isize + dx;
                *v = if sy >= 0 && sx >= 0 && (sy as usize) < h && (sx as usize) < w {
                    src[[sy as usize, sx as usize, c]]
                } else {
                    0.0
                };
            }
        }
        data
    }
}

#[cfg(test)]
fn ramp_batch() -> Batch {
    let images = Array4::from_shape_fn((2, 4, 4, 3), |(n, h, w, c)| (n * 100 + h * 10 + w) as f32 + c as f32 * 0.5);
    Batch::new(images, vec![0, 1]).unwrap()
}

#[test]
fn test_normalize() {
    let mut norm = Normalize { mean: vec![1.0, 2.0, 3.0], std: vec![2.0, 2.0, 2.0] };
    let batch = norm.transform(ramp_batch());
    assert_eq!(batch.images[[0, 0, 0, 0]], -0.5);
    assert_eq!(batch.images[[0, 0, 1, 2]], (1.0 + 1.0 - 3.0) / 2.0);
}

#[test]
fn test_flip_is_mirror_or_identity() {
    let mut flip = RandomFlip::new(3);
    let orig = ramp_batch();
    let out = flip.transform(orig.clone());
    for n in 0..2 {
        let a = orig.images.index_axis(Axis(0), n);
        let b = out.images.index_axis(Axis(0), n);
        let mirrored = a.slice(s![.., ..;-1, ..]);
        assert!(b == a || b == mirrored);
    }
}

#[test]
fn test_pad_crop_preserves_shape_and_content() {
    let mut crop = PadCrop::new(1, 11);
    let orig = ramp_batch();
    let out = crop.transform(orig.clone());
    assert_eq!(out.images.dim(), orig.images.dim());
    // every nonzero output pixel exists somewhere in the source image
    for n in 0..2 {
        let src = orig.images.index_axis(Axis(0), n);
        for v in out.images.index_axis(Axis(0), n).iter().filter(|v| **v != 0.0) {
            assert!(src.iter().any(|s| s == v));
        }
    }
    assert_eq!(out.labels, orig.labels);
}

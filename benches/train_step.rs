use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use train_lib::datasets::Batch;
use train_lib::distribute::{Mirrored, OneDevice};
use train_lib::models::{DenseNet, DenseNetParams};
use train_lib::Trainer;

fn model() -> DenseNet<f32> {
    let params = DenseNetParams { depth_of_model: Some(16), pool_initial: true, ..Default::default() };
    params.build([32, 32, 3], &mut StdRng::seed_from_u64(0)).unwrap()
}

fn batch(n: usize) -> Batch {
    let images = Array4::from_shape_fn((n, 32, 32, 3), |(i, h, w, c)| ((i + h * 3 + w * 5 + c) % 17) as f32 / 17.0);
    Batch::new(images, (0..n as u32).map(|i| i % 10).collect()).unwrap()
}

pub fn train_step(c: &mut Criterion) {
    let batch = batch(32);

    let mut trainer = Trainer::new(1, true, model()).unwrap();
    let one = OneDevice::default();
    c.bench_function("train step, one device", |b| {
        b.iter(|| black_box(trainer.train_step(&one, &batch).unwrap()))
    });

    let mut trainer = Trainer::new(1, true, model()).unwrap();
    let mirrored = Mirrored::with_cpus(4).unwrap();
    c.bench_function("train step, 4 mirrored replicas", |b| {
        b.iter(|| black_box(trainer.train_step(&mirrored, &batch).unwrap()))
    });

    let mut trainer = Trainer::new(1, true, model()).unwrap();
    c.bench_function("test step, one device", |b| {
        b.iter(|| black_box(trainer.test_step(&one, &batch).unwrap()))
    });
}

criterion_group!(benches, train_step);
criterion_main!(benches);

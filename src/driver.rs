//! Wires a validated configuration to a strategy, a model and the datasets,
//! then hands everything to the `Trainer`.
use std::io::Write;

use anyhow::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::configs::{ConfigError, DatasetKind, TrainConfig, TrainMode};
use crate::datasets::{Cursor, Dataset, DatasetBuilder, InMemoryImages};
use crate::distribute::{Mirrored, OneDevice, Strategy};
use crate::metrics::EpochMetrics;
use crate::models::{DenseNet, Model};
use crate::trainer::Trainer;

/// Trains according to `config`, printing progress to stdout
pub fn run(config: &TrainConfig) -> Result<EpochMetrics> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_output(config, &mut out)
}

pub fn run_with_output<W: Write>(config: &TrainConfig, out: &mut W) -> Result<EpochMetrics> {
    config.validate()?;
    match config.train_mode {
        TrainMode::CustomLoop => {}
        TrainMode::KerasFit => return Err(ConfigError::UnsupportedTrainMode.into()),
    }
    match config.dataset {
        DatasetKind::Cifar10 => train_on(config, &config.cifar_params()?, out),
        DatasetKind::Synthetic => train_on(config, &config.synthetic_params(), out),
    }
}

fn train_on<B, W>(config: &TrainConfig, builder: &B, out: &mut W) -> Result<EpochMetrics>
where
    B: DatasetBuilder<Dataset = InMemoryImages>,
    W: Write,
{
    let train = builder.build_train()?;
    let test = builder
        .build_test()
        .ok_or_else(|| Error::msg("dataset has no test partition"))??;

    if config.num_gpu == 1 {
        train_with(config, OneDevice::default(), train, test, out)
    } else {
        train_with(config, Mirrored::with_cpus(config.num_gpu)?, train, test, out)
    }
}

fn train_with<S, W>(
    config: &TrainConfig,
    strategy: S,
    train: InMemoryImages,
    test: InMemoryImages,
    out: &mut W,
) -> Result<EpochMetrics>
where
    S: Strategy,
    W: Write,
{
    let devices: Vec<String> = strategy.devices().iter().map(|d| d.to_string()).collect();
    info!(replicas = strategy.num_replicas_in_sync(), ?devices, "distribution strategy ready");

    let mut rng = StdRng::seed_from_u64(config.seed);
    let model: DenseNet<f32> = config.model_params().build(train.image_shape(), &mut rng)?;
    info!(params = model.num_params(), head_features = model.head_features(), "model built");

    let steps_per_epoch_train = train.num_examples() / config.batch_size;
    let steps_per_epoch_test = test.num_examples() / config.batch_size;
    if steps_per_epoch_train == 0 {
        warn!(examples = train.num_examples(), batch_size = config.batch_size, "no full training batch per epoch");
    }
    info!(steps_per_epoch_train, steps_per_epoch_test, "partitions ready");

    let mut trainer = Trainer::new(config.epochs, config.enable_function, model)?.with_seed(config.seed);
    let mut train = Cursor::new(train, "train", true);
    let mut test = Cursor::new(test, "test", false);

    writeln!(out, "Training...")?;
    trainer.run_loop_with_output(
        &mut train,
        &mut test,
        steps_per_epoch_train,
        steps_per_epoch_test,
        &strategy,
        out,
    )
}

#[cfg(test)]
fn smoke_config() -> TrainConfig {
    TrainConfig {
        epochs: 1,
        batch_size: 2,
        buffer_size: 4,
        dataset: DatasetKind::Synthetic,
        synthetic_train_examples: 4,
        synthetic_test_examples: 2,
        mode: crate::configs::BuildMode::FromList,
        growth_rate: 2,
        num_of_blocks: Some(1),
        num_layers_in_each_block: Some(vec![1]),
        pool_initial: true,
        ..Default::default()
    }
}

#[test]
fn test_run_synthetic() {
    let mut out = Vec::new();
    let metrics = run_with_output(&smoke_config(), &mut out).unwrap();
    assert!(metrics.is_finite());
    let out = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "Training...");
    assert!(lines[1].starts_with("Epoch: 0, "));
}

#[test]
fn test_keras_fit_rejected_before_output() {
    let config = TrainConfig { train_mode: TrainMode::KerasFit, ..smoke_config() };
    let mut out = Vec::new();
    let err = run_with_output(&config, &mut out).unwrap_err();
    assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::UnsupportedTrainMode));
    assert!(out.is_empty());
}

#[test]
fn test_missing_cifar_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainConfig { dataset: DatasetKind::Cifar10, data_dir: Some(dir.path().to_path_buf()), ..smoke_config() };
    let mut out = Vec::new();
    assert!(run_with_output(&config, &mut out).is_err());
    assert!(out.is_empty());
}

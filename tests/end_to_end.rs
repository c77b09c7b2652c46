use train_lib::configs::{BuildMode, ConfigError, DatasetKind, TrainConfig, TrainMode};
use train_lib::driver;

fn two_example_config(num_gpu: usize) -> TrainConfig {
    TrainConfig {
        epochs: 1,
        batch_size: 2,
        buffer_size: 2,
        num_gpu,
        dataset: DatasetKind::Synthetic,
        synthetic_train_examples: 2,
        synthetic_test_examples: 2,
        mode: BuildMode::FromList,
        growth_rate: 4,
        num_of_blocks: Some(2),
        num_layers_in_each_block: Some(vec![1, 1]),
        ..Default::default()
    }
}

fn epoch_lines(out: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(out)
        .lines()
        .filter(|l| l.starts_with("Epoch:"))
        .map(str::to_string)
        .collect()
}

#[test]
fn one_device_single_epoch() {
    let mut out = Vec::new();
    let metrics = driver::run_with_output(&two_example_config(1), &mut out).unwrap();
    assert!(metrics.is_finite());
    assert!(metrics.train_loss >= 0.0);
    assert!((0.0..=1.0).contains(&metrics.test_accuracy));

    let lines = epoch_lines(&out);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("Train Loss: "));
    assert!(lines[0].ends_with(&format!("Test Accuracy: {}", metrics.test_accuracy)));
}

#[test]
fn mirrored_two_devices() {
    let mut out = Vec::new();
    let config = TrainConfig { epochs: 2, ..two_example_config(2) };
    let metrics = driver::run_with_output(&config, &mut out).unwrap();
    assert!(metrics.is_finite());
    assert_eq!(epoch_lines(&out).len(), 2);
}

#[test]
fn default_topology_stays_finite() {
    // depth 40, three blocks, bottleneck and compression, at the full learning rate
    let config = TrainConfig {
        epochs: 3,
        buffer_size: 256,
        dataset: DatasetKind::Synthetic,
        synthetic_train_examples: 256,
        synthetic_test_examples: 64,
        ..Default::default()
    };
    assert_eq!(config.mode, BuildMode::FromDepth);
    let mut out = Vec::new();
    let metrics = driver::run_with_output(&config, &mut out).unwrap();

    let lines = epoch_lines(&out);
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| !l.contains("NaN") && !l.contains("inf")), "{lines:?}");
    assert!(metrics.is_finite(), "{metrics:?}");
}

#[test]
fn keras_fit_aborts_without_training() {
    let mut out = Vec::new();
    let config = TrainConfig { train_mode: TrainMode::KerasFit, ..two_example_config(1) };
    let err = driver::run_with_output(&config, &mut out).unwrap_err();
    assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::UnsupportedTrainMode));
    assert!(out.is_empty());
}

#[test]
fn invalid_topology_aborts_without_training() {
    let mut out = Vec::new();
    let config = TrainConfig { num_of_blocks: Some(3), ..two_example_config(1) };
    assert!(driver::run_with_output(&config, &mut out).is_err());
    assert!(out.is_empty());
}

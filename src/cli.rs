//! Command line flags of the training binary
use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};

use crate::configs::{BuildMode, DatasetKind, TrainConfig, TrainMode};
use crate::datasets::DataFormat;

/// Train a DenseNet image classifier over one or more replicas
#[derive(Parser, Debug, Clone)]
#[command(name = "densenet-train", version)]
pub struct Flags {
    /// Read the whole configuration from a RON file, other flags are ignored
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of epochs to train for
    #[arg(long, default_value_t = 300)]
    pub epochs: u32,

    /// Plan the distributed step once and reuse it
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enable_function: bool,

    /// Shuffle buffer size
    #[arg(long, default_value_t = 50000)]
    pub buffer_size: usize,

    /// Global batch size, split across replicas
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Either "from_depth" or "from_list"
    #[arg(long, default_value = "from_depth")]
    pub mode: BuildMode,

    #[arg(long, default_value_t = 12)]
    pub growth_rate: usize,

    #[arg(long, default_value_t = 10)]
    pub output_classes: usize,

    #[arg(long, default_value = "40")]
    pub depth_of_model: Option<usize>,

    #[arg(long, default_value = "3")]
    pub num_of_blocks: Option<usize>,

    /// Comma separated layer counts, used with --mode from_list
    #[arg(long, value_delimiter = ',')]
    pub num_layers_in_each_block: Option<Vec<usize>>,

    /// Either "channels_last" or "channels_first"
    #[arg(long, default_value = "channels_last")]
    pub data_format: DataFormat,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub bottleneck: bool,

    #[arg(long, default_value_t = 0.5)]
    pub compression: f32,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f32,

    #[arg(long, default_value_t = 0.0)]
    pub dropout_rate: f32,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub pool_initial: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub include_top: bool,

    /// Either "custom_loop" or "keras_fit"
    #[arg(long, default_value = "custom_loop")]
    pub train_mode: TrainMode,

    /// Directory holding the cifar10 binary files
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Either "cifar10" or "synthetic"
    #[arg(long, default_value = "cifar10")]
    pub dataset: DatasetKind,

    /// Number of replicas
    #[arg(long, default_value_t = 1)]
    pub num_gpu: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Training examples generated by --dataset synthetic
    #[arg(long, default_value_t = 512)]
    pub synthetic_train_examples: usize,

    /// Test examples generated by --dataset synthetic
    #[arg(long, default_value_t = 128)]
    pub synthetic_test_examples: usize,
}

impl Flags {
    pub fn into_config(self) -> Result<TrainConfig> {
        if let Some(path) = &self.config {
            return TrainConfig::load(path);
        }
        Ok(TrainConfig {
            epochs: self.epochs,
            enable_function: self.enable_function,
            buffer_size: self.buffer_size,
            batch_size: self.batch_size,
            mode: self.mode,
            growth_rate: self.growth_rate,
            output_classes: self.output_classes,
            depth_of_model: self.depth_of_model,
            num_of_blocks: self.num_of_blocks,
            num_layers_in_each_block: self.num_layers_in_each_block,
            data_format: self.data_format,
            bottleneck: self.bottleneck,
            compression: self.compression,
            weight_decay: self.weight_decay,
            dropout_rate: self.dropout_rate,
            pool_initial: self.pool_initial,
            include_top: self.include_top,
            train_mode: self.train_mode,
            data_dir: self.data_dir,
            dataset: self.dataset,
            num_gpu: self.num_gpu,
            seed: self.seed,
            synthetic_train_examples: self.synthetic_train_examples,
            synthetic_test_examples: self.synthetic_test_examples,
        })
    }
}

#[test]
fn test_defaults_match_config() {
    let flags = Flags::try_parse_from(["densenet-train"]).unwrap();
    assert_eq!(flags.into_config().unwrap(), TrainConfig::default());
}

#[test]
fn test_parse_flags() {
    let flags = Flags::try_parse_from([
        "densenet-train",
        "--epochs",
        "2",
        "--mode",
        "from_list",
        "--num-layers-in-each-block",
        "2,3,4",
        "--bottleneck",
        "false",
        "--dataset",
        "synthetic",
        "--num-gpu",
        "2",
        "--synthetic-train-examples",
        "64",
    ])
    .unwrap();
    let config = flags.into_config().unwrap();
    assert_eq!(config.epochs, 2);
    assert_eq!(config.mode, BuildMode::FromList);
    assert_eq!(config.num_layers_in_each_block, Some(vec![2, 3, 4]));
    assert!(!config.bottleneck);
    assert_eq!(config.dataset, DatasetKind::Synthetic);
    assert_eq!(config.num_gpu, 2);
    assert_eq!(config.synthetic_train_examples, 64);
    assert_eq!(config.synthetic_test_examples, 128);
}

#[test]
fn test_unknown_train_mode_rejected() {
    assert!(Flags::try_parse_from(["densenet-train", "--train-mode", "fit_loop"]).is_err());
    // keras_fit parses, validation refuses it later
    let flags = Flags::try_parse_from(["densenet-train", "--train-mode", "keras_fit"]).unwrap();
    assert_eq!(flags.train_mode, TrainMode::KerasFit);
    assert!(Flags::try_parse_from(["densenet-train", "--epochs", "1.5"]).is_err());
}

#[test]
fn test_config_file_flag() {
    use crate::Config;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.ron");
    let config = TrainConfig { epochs: 7, seed: 3, ..Default::default() };
    std::fs::write(&path, config.config().unwrap()).unwrap();

    let flags = Flags::try_parse_from(["densenet-train", "--config", path.to_str().unwrap()]).unwrap();
    assert_eq!(flags.into_config().unwrap(), config);
}

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datasets::cifar::Cifar10Params;
use crate::datasets::synthetic::SyntheticParams;
use crate::datasets::DataFormat;
pub use crate::models::densenet::BuildMode;
use crate::models::DenseNetParams;
use crate::Config;

/// Everything that can be wrong with a configuration, caught before training
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("`Strategy` does not support subclassed models yet.")]
    UnsupportedTrainMode,
    #[error("Please enter either \"keras_fit\" or \"custom_loop\", got {0:?}")]
    UnknownTrainMode(String),
    #[error("unknown build mode {0:?}, expected \"from_depth\" or \"from_list\"")]
    UnknownBuildMode(String),
    #[error("unknown dataset {0:?}, expected \"cifar10\" or \"synthetic\"")]
    UnknownDataset(String),
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("depth_of_model is required when building from depth")]
    MissingDepth,
    #[error("num_of_blocks is required when building from depth")]
    MissingBlocks,
    #[error("depth_of_model must be of the form 3N + 4, got {0}")]
    InvalidDepth(usize),
    #[error("num_layers_in_each_block is required when building from a list")]
    MissingBlockList,
    #[error("num_layers_in_each_block has {got} entries but num_of_blocks is {expected}")]
    BlockListLength { expected: usize, got: usize },
    #[error("{name} must lie in [{low}, {high}], got {value}")]
    OutOfRange { name: &'static str, value: f32, low: f32, high: f32 },
    #[error("include_top is false, there is no classifier to train")]
    NoClassifierHead,
    #[error("the cifar10 dataset needs a data_dir")]
    MissingDataDir,
}

/// How the model is trained
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrainMode {
    /// the hand written epoch loop in `Trainer`
    #[default]
    CustomLoop,
    /// accepted by the parser, refused at validation
    KerasFit,
}

impl FromStr for TrainMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "custom_loop" => Ok(TrainMode::CustomLoop),
            "keras_fit" => Ok(TrainMode::KerasFit),
            _ => Err(ConfigError::UnknownTrainMode(s.to_string())),
        }
    }
}

impl Display for TrainMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainMode::CustomLoop => write!(f, "custom_loop"),
            TrainMode::KerasFit => write!(f, "keras_fit"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    #[default]
    Cifar10,
    /// generated in memory, no files needed
    Synthetic,
}

impl FromStr for DatasetKind {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "cifar10" => Ok(DatasetKind::Cifar10),
            "synthetic" => Ok(DatasetKind::Synthetic),
            _ => Err(ConfigError::UnknownDataset(s.to_string())),
        }
    }
}

impl Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetKind::Cifar10 => write!(f, "cifar10"),
            DatasetKind::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// All hyperparameters of a training run
#[derive(Derivative, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[derivative(Default)]
#[serde(default)]
pub struct TrainConfig {
    #[derivative(Default(value = "300"))]
    pub epochs: u32,
    #[derivative(Default(value = "true"))]
    pub enable_function: bool,
    #[derivative(Default(value = "50000"))]
    pub buffer_size: usize,
    #[derivative(Default(value = "64"))]
    pub batch_size: usize,
    pub mode: BuildMode,
    #[derivative(Default(value = "12"))]
    pub growth_rate: usize,
    #[derivative(Default(value = "10"))]
    pub output_classes: usize,
    #[derivative(Default(value = "Some(40)"))]
    pub depth_of_model: Option<usize>,
    #[derivative(Default(value = "Some(3)"))]
    pub num_of_blocks: Option<usize>,
    pub num_layers_in_each_block: Option<Vec<usize>>,
    pub data_format: DataFormat,
    #[derivative(Default(value = "true"))]
    pub bottleneck: bool,
    #[derivative(Default(value = "0.5"))]
    pub compression: f32,
    #[derivative(Default(value = "1e-4"))]
    pub weight_decay: f32,
    pub dropout_rate: f32,
    pub pool_initial: bool,
    #[derivative(Default(value = "true"))]
    pub include_top: bool,
    pub train_mode: TrainMode,
    /// directory of the cifar10 binary files
    pub data_dir: Option<PathBuf>,
    pub dataset: DatasetKind,
    /// number of replicas to train on
    #[derivative(Default(value = "1"))]
    pub num_gpu: usize,
    #[derivative(Default(value = "42"))]
    pub seed: u64,
    /// examples per partition when `dataset` is synthetic
    #[derivative(Default(value = "512"))]
    pub synthetic_train_examples: usize,
    #[derivative(Default(value = "128"))]
    pub synthetic_test_examples: usize,
}

impl TrainConfig {
    /// Checks every field that can be checked without touching the data
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.train_mode == TrainMode::KerasFit {
            return Err(ConfigError::UnsupportedTrainMode);
        }
        if self.epochs == 0 {
            return Err(ConfigError::NotPositive("epochs"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive("batch_size"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::NotPositive("buffer_size"));
        }
        if self.num_gpu == 0 {
            return Err(ConfigError::NotPositive("num_gpu"));
        }
        if self.dataset == DatasetKind::Cifar10 && self.data_dir.is_none() {
            return Err(ConfigError::MissingDataDir);
        }
        self.model_params().validate()
    }

    pub fn model_params(&self) -> DenseNetParams {
        DenseNetParams {
            mode: self.mode,
            growth_rate: self.growth_rate,
            output_classes: self.output_classes,
            depth_of_model: self.depth_of_model,
            num_of_blocks: self.num_of_blocks,
            num_layers_in_each_block: self.num_layers_in_each_block.clone(),
            data_format: self.data_format,
            bottleneck: self.bottleneck,
            compression: self.compression,
            weight_decay: self.weight_decay,
            dropout_rate: self.dropout_rate,
            pool_initial: self.pool_initial,
            include_top: self.include_top,
        }
    }

    pub fn cifar_params(&self) -> Result<Cifar10Params, ConfigError> {
        let path = self.data_dir.clone().ok_or(ConfigError::MissingDataDir)?;
        Ok(Cifar10Params {
            path,
            batch_size: self.batch_size,
            buffer_size: self.buffer_size,
            data_format: self.data_format,
            seed: self.seed,
        })
    }

    pub fn synthetic_params(&self) -> SyntheticParams {
        SyntheticParams {
            train_examples: self.synthetic_train_examples,
            test_examples: self.synthetic_test_examples,
            classes: self.output_classes,
            batch_size: self.batch_size,
            buffer_size: self.buffer_size,
            data_format: self.data_format,
            seed: self.seed,
            ..Default::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let mut config = Self::default();
        config.load_config(&text)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.config()?).with_context(|| format!("writing config {}", path.display()))
    }
}

#[test]
fn test_defaults() {
    let config = TrainConfig::default();
    assert_eq!(config.epochs, 300);
    assert_eq!(config.batch_size, 64);
    assert_eq!(config.buffer_size, 50000);
    assert_eq!(config.depth_of_model, Some(40));
    assert_eq!(config.train_mode, TrainMode::CustomLoop);
    assert_eq!(config.num_gpu, 1);
    assert_eq!(config.model_params(), DenseNetParams::default());
    // cifar10 without a directory
    assert_eq!(config.validate(), Err(ConfigError::MissingDataDir));
}

#[test]
fn test_train_mode_parse() {
    assert_eq!("custom_loop".parse::<TrainMode>(), Ok(TrainMode::CustomLoop));
    assert_eq!("keras_fit".parse::<TrainMode>(), Ok(TrainMode::KerasFit));
    assert_eq!(
        "fit_loop".parse::<TrainMode>(),
        Err(ConfigError::UnknownTrainMode("fit_loop".to_string()))
    );
    assert_eq!(TrainMode::KerasFit.to_string(), "keras_fit");
}

#[test]
fn test_validate_rejects() {
    let ok = TrainConfig { dataset: DatasetKind::Synthetic, ..Default::default() };
    assert_eq!(ok.validate(), Ok(()));

    let keras = TrainConfig { train_mode: TrainMode::KerasFit, ..ok.clone() };
    assert_eq!(keras.validate(), Err(ConfigError::UnsupportedTrainMode));
    assert_eq!(
        ConfigError::UnsupportedTrainMode.to_string(),
        "`Strategy` does not support subclassed models yet."
    );

    let zero = TrainConfig { epochs: 0, ..ok.clone() };
    assert_eq!(zero.validate(), Err(ConfigError::NotPositive("epochs")));
    let zero = TrainConfig { num_gpu: 0, ..ok.clone() };
    assert_eq!(zero.validate(), Err(ConfigError::NotPositive("num_gpu")));

    let depth = TrainConfig { depth_of_model: Some(11), ..ok.clone() };
    assert_eq!(depth.validate(), Err(ConfigError::InvalidDepth(11)));

    let dropout = TrainConfig { dropout_rate: 1.0, ..ok.clone() };
    assert!(matches!(dropout.validate(), Err(ConfigError::OutOfRange { name: "dropout_rate", .. })));
}

#[test]
fn test_ron_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.ron");
    let config = TrainConfig {
        epochs: 3,
        mode: BuildMode::FromList,
        num_layers_in_each_block: Some(vec![2, 4]),
        num_of_blocks: Some(2),
        data_format: DataFormat::ChannelsFirst,
        data_dir: Some("/data/cifar".into()),
        ..Default::default()
    };
    config.save(&path).unwrap();
    assert_eq!(TrainConfig::load(&path).unwrap(), config);
}

#[test]
fn test_partial_ron() {
    let mut config = TrainConfig::default();
    config.load_config("(epochs: 2, dataset: synthetic, train_mode: custom_loop)").unwrap();
    assert_eq!(config.epochs, 2);
    assert_eq!(config.dataset, DatasetKind::Synthetic);
    assert_eq!(config.batch_size, 64);
    assert!(config.load_config("(epochs: \"many\")").is_err());
}

/////////////////////////////////////////////////////////////////////////////////////////
// The Data types that the datasets output and transforms input.
use std::fmt::Display;
use std::ops::Range;
use std::str::FromStr;

use anyhow::{Error, Result};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// Memory layout of the image axes in a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// [N, H, W, C]
    #[default]
    ChannelsLast,
    /// [N, C, H, W]
    ChannelsFirst,
}

impl DataFormat {
    /// (height, width) axes of a 4d batch
    pub fn spatial_axes(&self) -> [usize; 2] {
        match self {
            DataFormat::ChannelsLast => [1, 2],
            DataFormat::ChannelsFirst => [2, 3],
        }
    }
}

impl FromStr for DataFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "channels_last" => Ok(DataFormat::ChannelsLast),
            "channels_first" => Ok(DataFormat::ChannelsFirst),
            _ => Err(Error::msg(format!(
                "unknown data format {s:?}, expected \"channels_last\" or \"channels_first\""
            ))),
        }
    }
}

impl Display for DataFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataFormat::ChannelsLast => write!(f, "channels_last"),
            DataFormat::ChannelsFirst => write!(f, "channels_first"),
        }
    }
}

/// One batch of the image classification task, this is the type which
/// gets fed into the model. Images are laid out according to the dataset's
/// `DataFormat`, labels are class indices.
#[derive(Clone, Debug)]
pub struct Batch {
    pub images: Array4<f32>,
    pub labels: Vec<u32>,
}

impl Batch {
    pub fn new(images: Array4<f32>, labels: Vec<u32>) -> Result<Self> {
        if images.len_of(Axis(0)) != labels.len() {
            return Err(Error::msg(format!(
                "batch has {} images but {} labels",
                images.len_of(Axis(0)),
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Copies out the examples in `range`, used to split a batch across replicas
    pub fn shard(&self, range: Range<usize>) -> Batch {
        let images = self.images.slice(s![range.clone(), .., .., ..]).to_owned();
        let labels = self.labels[range].to_vec();
        Batch { images, labels }
    }
}

#[test]
fn test_batch_shard() {
    let images = Array4::from_shape_fn((5, 2, 2, 1), |(n, _, _, _)| n as f32);
    let batch = Batch::new(images, vec![0, 1, 2, 3, 4]).unwrap();
    let shard = batch.shard(2..4);
    assert_eq!(shard.len(), 2);
    assert_eq!(shard.labels, vec![2, 3]);
    assert!(shard.images.index_axis(Axis(0), 1).iter().all(|x| *x == 3.0));
}

#[test]
fn test_batch_label_mismatch() {
    let images = Array4::<f32>::zeros((3, 2, 2, 1));
    assert!(Batch::new(images, vec![0, 1]).is_err());
}

#[test]
fn test_data_format_parse() {
    assert_eq!("channels_first".parse::<DataFormat>().unwrap(), DataFormat::ChannelsFirst);
    assert!("nhwc".parse::<DataFormat>().is_err());
    assert_eq!(DataFormat::ChannelsLast.to_string(), "channels_last");
}

use std::fmt::Display;

use anyhow::{Error, Result};
use itertools::Itertools;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// A running aggregate over a stream of per-batch values
pub trait Metric {
    fn name(&self) -> &str;
    fn result(&self) -> f32;
    fn reset_states(&mut self);
}

/// Weighted running mean
#[derive(Debug, Clone)]
pub struct Mean {
    name: String,
    total: f64,
    count: f64,
}

impl Mean {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), total: 0.0, count: 0.0 }
    }

    pub fn update_state(&mut self, value: f32, weight: f32) {
        self.total += value as f64 * weight as f64;
        self.count += weight as f64;
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

impl Metric for Mean {
    fn name(&self) -> &str {
        &self.name
    }

    fn result(&self) -> f32 {
        if self.count == 0.0 {
            0.0
        } else {
            (self.total / self.count) as f32
        }
    }

    fn reset_states(&mut self) {
        self.total = 0.0;
        self.count = 0.0;
    }
}

/// Fraction of examples whose highest scoring class is the label
#[derive(Debug, Clone)]
pub struct SparseCategoricalAccuracy {
    name: String,
    correct: u64,
    total: u64,
}

impl SparseCategoricalAccuracy {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), correct: 0, total: 0 }
    }

    pub fn update_state(&mut self, labels: &[u32], logits: &ArrayView2<f32>) -> Result<()> {
        if labels.len() != logits.nrows() {
            return Err(Error::msg(format!(
                "{} labels for {} predictions",
                labels.len(),
                logits.nrows()
            )));
        }
        for (row, label) in logits.outer_iter().zip(labels) {
            // first maximum wins ties
            let pred = row.iter().position_min_by(|a, b| b.total_cmp(a));
            if pred == Some(*label as usize) {
                self.correct += 1;
            }
            self.total += 1;
        }
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.total
    }
}

impl Metric for SparseCategoricalAccuracy {
    fn name(&self) -> &str {
        &self.name
    }

    fn result(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.correct as f64 / self.total as f64) as f32
        }
    }

    fn reset_states(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// The four values reported at the end of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub test_loss: f32,
    pub test_accuracy: f32,
}

impl EpochMetrics {
    pub fn is_finite(&self) -> bool {
        [self.train_loss, self.train_accuracy, self.test_loss, self.test_accuracy]
            .iter()
            .all(|x| x.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: u32,
    pub metrics: EpochMetrics,
}

impl Display for EpochSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.metrics;
        write!(
            f,
            "Epoch: {}, Train Loss: {}, Train Accuracy: {}, Test Loss: {}, Test Accuracy: {}",
            self.epoch, m.train_loss, m.train_accuracy, m.test_loss, m.test_accuracy
        )
    }
}

#[test]
fn test_mean() {
    use approx::assert_relative_eq;
    let mut m = Mean::new("loss");
    assert_eq!(m.result(), 0.0);
    m.update_state(1.0, 1.0);
    m.update_state(4.0, 2.0);
    assert_relative_eq!(m.result(), 3.0);
    assert_eq!(m.count(), 3.0);
    m.reset_states();
    assert_eq!(m.result(), 0.0);
    assert_eq!(m.name(), "loss");
}

#[test]
fn test_accuracy() {
    use approx::assert_relative_eq;
    let mut acc = SparseCategoricalAccuracy::new("accuracy");
    let logits = array![[0.1, 0.9, 0.0], [2.0, 1.0, 0.5], [0.3, 0.3, 0.1], [0.0, 0.0, 1.0]];
    acc.update_state(&[1, 0, 1, 0], &logits.view()).unwrap();
    // the tie in row 2 goes to class 0
    assert_relative_eq!(acc.result(), 0.5);
    assert!(acc.update_state(&[0], &logits.view()).is_err());
    assert_eq!(acc.count(), 4);
    acc.reset_states();
    assert_eq!(acc.result(), 0.0);
}

#[test]
fn test_summary_line() {
    let summary = EpochSummary {
        epoch: 3,
        metrics: EpochMetrics { train_loss: 0.5, train_accuracy: 0.75, test_loss: 1.25, test_accuracy: 0.5 },
    };
    assert_eq!(
        summary.to_string(),
        "Epoch: 3, Train Loss: 0.5, Train Accuracy: 0.75, Test Loss: 1.25, Test Accuracy: 0.5"
    );
}

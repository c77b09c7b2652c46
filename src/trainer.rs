use std::io::Write;

use anyhow::{Error, Result};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::configs::ConfigError;
use crate::datasets::{Batch, Cursor, Dataset};
use crate::distribute::{reduce_mean, reduce_statistics, ShardPlan, Strategy};
use crate::metrics::{EpochMetrics, EpochSummary, Mean, Metric, SparseCategoricalAccuracy};
use crate::models::{BatchStatistics, Gradients, Model};
use crate::nn::SparseCategoricalCrossentropy;
use crate::optim::Sgd;
use crate::schedule;

pub const INITIAL_LEARNING_RATE: f64 = 0.1;
pub const MOMENTUM: f32 = 0.9;

/// What one replica hands back from a training step
struct TrainOutput {
    loss: f32,
    logits: Array2<f32>,
    labels: Vec<u32>,
    grads: Gradients,
    statistics: BatchStatistics,
}

struct TestOutput {
    loss: f32,
    logits: Array2<f32>,
    labels: Vec<u32>,
}

/// Random stream of one replica for one step, so that dropout masks do not
/// depend on thread scheduling
fn replica_rng(seed: u64, step: u64, replica: usize) -> StdRng {
    let mixed = seed
        ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (replica as u64 + 1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    StdRng::seed_from_u64(mixed)
}

/// Owns the model, the loss, the optimizer and the running metrics, and
/// drives the epoch loop over a distribution strategy.
pub struct Trainer<M: Model> {
    epochs: u32,
    enable_function: bool,
    model: M,
    loss_object: SparseCategoricalCrossentropy,
    optimizer: Sgd,
    train_loss_metric: Mean,
    train_acc_metric: SparseCategoricalAccuracy,
    test_loss_metric: Mean,
    test_acc_metric: SparseCategoricalAccuracy,
    seed: u64,
    steps: u64,
    /// shard plan reused across steps when `enable_function` is set,
    /// keyed by (batch length, replicas)
    plan_cache: Option<((usize, usize), ShardPlan)>,
    history: Vec<EpochSummary>,
}

impl<M: Model> Trainer<M> {
    pub fn new(epochs: u32, enable_function: bool, model: M) -> Result<Self> {
        if epochs == 0 {
            return Err(ConfigError::NotPositive("epochs").into());
        }
        Ok(Self {
            epochs,
            enable_function,
            model,
            loss_object: SparseCategoricalCrossentropy::new(true),
            optimizer: Sgd::new(INITIAL_LEARNING_RATE, MOMENTUM, true),
            train_loss_metric: Mean::new("train_loss"),
            train_acc_metric: SparseCategoricalAccuracy::new("train_accuracy"),
            test_loss_metric: Mean::new("test_loss"),
            test_acc_metric: SparseCategoricalAccuracy::new("test_accuracy"),
            seed: 0,
            steps: 0,
            plan_cache: None,
            history: Vec::new(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn epochs(&self) -> u32 {
        self.epochs
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn history(&self) -> &[EpochSummary] {
        &self.history
    }

    pub fn train_loss(&self) -> &Mean {
        &self.train_loss_metric
    }

    pub fn train_accuracy(&self) -> &SparseCategoricalAccuracy {
        &self.train_acc_metric
    }

    pub fn test_loss(&self) -> &Mean {
        &self.test_loss_metric
    }

    pub fn test_accuracy(&self) -> &SparseCategoricalAccuracy {
        &self.test_acc_metric
    }

    /// Current values of the four accumulators
    pub fn metrics(&self) -> EpochMetrics {
        EpochMetrics {
            train_loss: self.train_loss_metric.result(),
            train_accuracy: self.train_acc_metric.result(),
            test_loss: self.test_loss_metric.result(),
            test_accuracy: self.test_acc_metric.result(),
        }
    }

    /// Resets all four accumulators together
    pub fn reset_metrics(&mut self) {
        self.train_loss_metric.reset_states();
        self.train_acc_metric.reset_states();
        self.test_loss_metric.reset_states();
        self.test_acc_metric.reset_states();
    }

    fn plan(&mut self, batch_len: usize, replicas: usize) -> ShardPlan {
        let key = (batch_len, replicas);
        if let Some((k, plan)) = &self.plan_cache {
            if *k == key {
                return plan.clone();
            }
        }
        let plan = ShardPlan::new(batch_len, replicas);
        if self.enable_function {
            debug!(batch_len, replicas, "planned distributed step");
            self.plan_cache = Some((key, plan.clone()));
        }
        plan
    }

    /// One optimization step over `batch`, returning the mean replica loss
    pub fn train_step<S: Strategy>(&mut self, strategy: &S, batch: &Batch) -> Result<f32> {
        if batch.is_empty() {
            return Err(Error::msg("cannot train on an empty batch"));
        }
        let plan = self.plan(batch.len(), strategy.num_replicas_in_sync());
        let step = self.steps;
        self.steps += 1;

        let (model, loss_object, seed) = (&self.model, &self.loss_object, self.seed);
        let outputs = strategy.run(&plan, batch, |ctx, shard| {
            let mut rng = replica_rng(seed, step, ctx.replica_id);
            let (logits, cache) = model.forward(shard.images.view(), true, &mut rng)?;
            let (loss, grad_logits) = loss_object.forward(&shard.labels, &logits.view())?;
            let loss = loss + model.losses().iter().sum::<f32>();
            let statistics = model.batch_statistics(&cache);
            let mut grads = model.backward(cache, grad_logits.view());
            model.add_loss_gradients(&mut grads);
            Ok(TrainOutput { loss, logits, labels: shard.labels, grads, statistics })
        })?;

        let replicas = outputs.len();
        let mut total_loss = 0.0;
        let mut replica_grads = Vec::with_capacity(replicas);
        let mut replica_stats = Vec::with_capacity(replicas);
        for out in outputs {
            self.train_loss_metric.update_state(out.loss, 1.0);
            self.train_acc_metric.update_state(&out.labels, &out.logits.view())?;
            total_loss += out.loss;
            replica_grads.push((out.grads, out.labels.len()));
            replica_stats.push((out.statistics, out.labels.len()));
        }
        let grads = reduce_mean(replica_grads)?;
        self.optimizer.apply_gradients(&mut self.model, &grads)?;
        self.model.update_moving_statistics(&reduce_statistics(replica_stats)?)?;
        Ok(total_loss / replicas as f32)
    }

    /// Evaluates `batch` in inference mode: no dropout, normalization by the
    /// moving moments, no updates of any kind
    pub fn test_step<S: Strategy>(&mut self, strategy: &S, batch: &Batch) -> Result<f32> {
        if batch.is_empty() {
            return Err(Error::msg("cannot evaluate an empty batch"));
        }
        let plan = self.plan(batch.len(), strategy.num_replicas_in_sync());
        let step = self.steps;

        let (model, loss_object, seed) = (&self.model, &self.loss_object, self.seed);
        let outputs = strategy.run(&plan, batch, |ctx, shard| {
            let mut rng = replica_rng(seed, step, ctx.replica_id);
            let (logits, _) = model.forward(shard.images.view(), false, &mut rng)?;
            let loss = loss_object.call(&shard.labels, &logits.view())? + model.losses().iter().sum::<f32>();
            Ok(TestOutput { loss, logits, labels: shard.labels })
        })?;

        let replicas = outputs.len();
        let mut total_loss = 0.0;
        for out in outputs {
            self.test_loss_metric.update_state(out.loss, 1.0);
            self.test_acc_metric.update_state(&out.labels, &out.logits.view())?;
            total_loss += out.loss;
        }
        Ok(total_loss / replicas as f32)
    }

    /// Runs every epoch, printing a summary line per epoch to stdout
    pub fn run_loop<S, Tr, Te>(
        &mut self,
        train: &mut Cursor<Tr>,
        test: &mut Cursor<Te>,
        steps_per_epoch_train: usize,
        steps_per_epoch_test: usize,
        strategy: &S,
    ) -> Result<EpochMetrics>
    where
        S: Strategy,
        Tr: Dataset<DataPoint = Batch>,
        Te: Dataset<DataPoint = Batch>,
    {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.run_loop_with_output(train, test, steps_per_epoch_train, steps_per_epoch_test, strategy, &mut out)
    }

    pub fn run_loop_with_output<S, Tr, Te, W>(
        &mut self,
        train: &mut Cursor<Tr>,
        test: &mut Cursor<Te>,
        steps_per_epoch_train: usize,
        steps_per_epoch_test: usize,
        strategy: &S,
        out: &mut W,
    ) -> Result<EpochMetrics>
    where
        S: Strategy,
        Tr: Dataset<DataPoint = Batch>,
        Te: Dataset<DataPoint = Batch>,
        W: Write,
    {
        for epoch in 0..self.epochs {
            self.optimizer.set_lr(schedule::decay(epoch));

            train.initialize();
            for _ in 0..steps_per_epoch_train {
                let batch = train.next_batch()?;
                self.train_step(strategy, &batch)?;
            }

            test.initialize();
            for _ in 0..steps_per_epoch_test {
                let batch = test.next_batch()?;
                self.test_step(strategy, &batch)?;
            }

            let summary = EpochSummary { epoch, metrics: self.metrics() };
            info!(
                epoch,
                lr = self.optimizer.learning_rate(),
                train_loss = summary.metrics.train_loss,
                test_accuracy = summary.metrics.test_accuracy,
                "epoch finished"
            );
            writeln!(out, "{summary}")?;
            self.history.push(summary);

            if epoch + 1 != self.epochs {
                self.reset_metrics();
            }
        }
        Ok(self.metrics())
    }
}

#[cfg(test)]
mod fixtures {
    use super::*;
    use crate::datasets::synthetic::SyntheticParams;
    use crate::datasets::{DatasetBuilder, InMemoryImages};
    use crate::models::densenet::BuildMode;
    use crate::models::{DenseNet, DenseNetParams};

    pub fn data(batch_size: usize) -> SyntheticParams {
        SyntheticParams {
            train_examples: 8,
            test_examples: 4,
            image_shape: [2, 2, 3],
            classes: 3,
            batch_size,
            ..Default::default()
        }
    }

    pub fn model(seed: u64) -> DenseNet<f32> {
        let params = DenseNetParams {
            mode: BuildMode::FromList,
            growth_rate: 2,
            output_classes: 3,
            num_of_blocks: Some(2),
            num_layers_in_each_block: Some(vec![1, 1]),
            ..Default::default()
        };
        params.build([2, 2, 3], &mut StdRng::seed_from_u64(seed)).unwrap()
    }

    pub fn cursors(batch_size: usize) -> (Cursor<InMemoryImages>, Cursor<InMemoryImages>) {
        let data = data(batch_size);
        let train = Cursor::new(data.build_train().unwrap(), "train", true);
        let test = Cursor::new(data.build_test().unwrap().unwrap(), "test", false);
        (train, test)
    }

    pub fn first_batch(batch_size: usize) -> Batch {
        let mut train = data(batch_size).build_train().unwrap();
        train.next().unwrap()
    }
}

#[test]
fn test_train_step_updates_train_metrics() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(1, true, fixtures::model(0)).unwrap();
    let batch = fixtures::first_batch(4);
    let before = trainer.model().snapshot();

    let loss = trainer.train_step(&OneDevice::default(), &batch).unwrap();
    assert!(loss >= 0.0 && loss.is_finite());
    assert_eq!(trainer.train_loss().count(), 1.0);
    assert_eq!(trainer.train_accuracy().count(), 4);
    assert_eq!(trainer.test_accuracy().count(), 0);
    assert_ne!(before, trainer.model().snapshot());
}

#[test]
fn test_test_step_leaves_parameters() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(1, true, fixtures::model(0)).unwrap();
    let batch = fixtures::first_batch(4);
    let before = trainer.model().snapshot();

    let loss = trainer.test_step(&OneDevice::default(), &batch).unwrap();
    assert!(loss >= 0.0);
    assert_eq!(before, trainer.model().snapshot());
    assert_eq!(trainer.test_accuracy().count(), 4);
    assert_eq!(trainer.train_accuracy().count(), 0);
}

#[test]
fn test_single_epoch_keeps_metrics() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(1, true, fixtures::model(1)).unwrap();
    let (mut train, mut test) = fixtures::cursors(2);
    let mut out = Vec::new();
    let metrics = trainer
        .run_loop_with_output(&mut train, &mut test, 3, 2, &OneDevice::default(), &mut out)
        .unwrap();

    assert!(metrics.is_finite());
    assert_eq!(metrics, trainer.metrics());
    // nothing was reset after the only epoch
    assert_eq!(trainer.train_accuracy().count(), 6);
    assert_eq!(trainer.test_accuracy().count(), 4);
    let out = String::from_utf8(out).unwrap();
    assert_eq!(out.lines().count(), 1);
    assert!(out.starts_with("Epoch: 0, Train Loss: "));
}

#[test]
fn test_metrics_reset_between_epochs() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(2, true, fixtures::model(1)).unwrap();
    let (mut train, mut test) = fixtures::cursors(2);
    let mut out = Vec::new();
    trainer
        .run_loop_with_output(&mut train, &mut test, 4, 2, &OneDevice::default(), &mut out)
        .unwrap();

    // only the second epoch's batches are counted
    assert_eq!(trainer.train_accuracy().count(), 8);
    assert_eq!(trainer.train_loss().count(), 4.0);
    assert_eq!(trainer.test_accuracy().count(), 4);
    assert_eq!(trainer.history().len(), 2);
    assert_eq!(trainer.history()[1].metrics, trainer.metrics());
    let out = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("Epoch: 1,"));
}

#[test]
fn test_exhausted_cursor_is_error() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(1, true, fixtures::model(2)).unwrap();
    let (mut train, mut test) = fixtures::cursors(4);
    let mut out = Vec::new();
    // 8 training examples only make 2 batches of 4
    let res = trainer.run_loop_with_output(&mut train, &mut test, 3, 1, &OneDevice::default(), &mut out);
    assert!(res.is_err());
    assert!(out.is_empty());
}

#[test]
fn test_single_replica_mirrored_matches_one_device() {
    use crate::distribute::{Mirrored, OneDevice};
    let batch = fixtures::first_batch(4);

    let mut single = Trainer::new(1, true, fixtures::model(3)).unwrap();
    let mut mirrored = Trainer::new(1, true, fixtures::model(3)).unwrap();
    single.train_step(&OneDevice::default(), &batch).unwrap();
    mirrored.train_step(&Mirrored::with_cpus(1).unwrap(), &batch).unwrap();
    assert_eq!(single.model().snapshot(), mirrored.model().snapshot());
    assert_eq!(single.model().moving_statistics()[0].0, mirrored.model().moving_statistics()[0].0);
}

#[test]
fn test_mirrored_step_averages_replicas() {
    use crate::distribute::{Mirrored, OneDevice};
    let batch = fixtures::first_batch(4);

    let mut single = Trainer::new(1, true, fixtures::model(3)).unwrap();
    let mut mirrored = Trainer::new(1, true, fixtures::model(3)).unwrap();
    single.train_step(&OneDevice::default(), &batch).unwrap();
    mirrored.train_step(&Mirrored::with_cpus(2).unwrap(), &batch).unwrap();

    assert_eq!(single.train_accuracy().count(), mirrored.train_accuracy().count());
    assert_eq!(mirrored.train_loss().count(), 2.0);
    assert!(mirrored.model().snapshot().iter().all(|(_, p)| p.iter().all(|v| v.is_finite())));
    // the stem sees the same images, so the averaged shard means equal the batch mean
    let (a, _) = &single.model().moving_statistics()[0];
    let (b, _) = &mirrored.model().moving_statistics()[0];
    for (x, y) in a.iter().zip(b.iter()) {
        approx::assert_abs_diff_eq!(*x, *y, epsilon = 1e-5);
    }
}

#[test]
fn test_steps_and_moving_statistics() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(1, true, fixtures::model(6)).unwrap();
    let batch = fixtures::first_batch(4);
    let initial = trainer.model().moving_statistics();

    trainer.train_step(&OneDevice::default(), &batch).unwrap();
    let trained = trainer.model().moving_statistics();
    assert_ne!(initial[0].0, trained[0].0);

    trainer.test_step(&OneDevice::default(), &batch).unwrap();
    let tested = trainer.model().moving_statistics();
    for ((m0, v0), (m1, v1)) in trained.iter().zip(tested.iter()) {
        assert_eq!(m0, m1);
        assert_eq!(v0, v1);
    }

    // evaluation normalizes by the moving moments, so a lone example scores
    // the same as inside its batch
    let lone = Batch::new(batch.images.slice(s![..1, .., .., ..]).to_owned(), batch.labels[..1].to_vec()).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let (in_batch, _) = trainer.model().forward(batch.images.view(), false, &mut rng).unwrap();
    let (alone, _) = trainer.model().forward(lone.images.view(), false, &mut rng).unwrap();
    for (a, b) in alone.row(0).iter().zip(in_batch.row(0).iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
    let alone_loss = trainer.test_step(&OneDevice::default(), &lone).unwrap();
    let expected = SparseCategoricalCrossentropy::new(true).call(&lone.labels, &alone.view()).unwrap()
        + trainer.model().losses().iter().sum::<f32>();
    approx::assert_abs_diff_eq!(alone_loss, expected, epsilon = 1e-4);
}

#[test]
fn test_enable_function_does_not_change_results() {
    use crate::distribute::Mirrored;
    let strategy = Mirrored::with_cpus(2).unwrap();
    let batch = fixtures::first_batch(4);

    let mut planned = Trainer::new(1, true, fixtures::model(4)).unwrap();
    let mut eager = Trainer::new(1, false, fixtures::model(4)).unwrap();
    for _ in 0..2 {
        planned.train_step(&strategy, &batch).unwrap();
        eager.train_step(&strategy, &batch).unwrap();
    }
    assert_eq!(planned.model().snapshot(), eager.model().snapshot());
    assert!(planned.plan_cache.is_some());
    assert!(eager.plan_cache.is_none());
}

#[test]
fn test_zero_epochs_rejected() {
    assert!(Trainer::new(0, true, fixtures::model(0)).is_err());
}

#[test]
fn test_learning_rate_follows_schedule() {
    use crate::distribute::OneDevice;
    let mut trainer = Trainer::new(1, true, fixtures::model(5)).unwrap();
    let (mut train, mut test) = fixtures::cursors(4);
    trainer
        .run_loop_with_output(&mut train, &mut test, 1, 1, &OneDevice::default(), &mut std::io::sink())
        .unwrap();
    assert_eq!(trainer.optimizer().learning_rate(), schedule::decay(0));
}

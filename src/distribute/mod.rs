//! Running one step function on several replicas. A batch is split into
//! contiguous shards, one per replica, and every replica computes on its shard.
//! `Strategy::run` only returns once every replica is done.
use std::fmt::Display;
use std::ops::Range;

use anyhow::{Error, Result};
use tracing::trace;

use crate::datasets::Batch;
use crate::models::{BatchStatistics, Gradients};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
}

impl Device {
    pub fn cpu(i: usize) -> Self {
        Self { name: format!("/device:CPU:{i}") }
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Shard boundaries of a batch. Examples are split as evenly as possible,
/// the first `len % replicas` replicas take one extra, and replicas which
/// would get no examples are left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    batch_len: usize,
    shards: Vec<Range<usize>>,
}

impl ShardPlan {
    pub fn new(batch_len: usize, replicas: usize) -> Self {
        let replicas = replicas.max(1);
        let base = batch_len / replicas;
        let rem = batch_len % replicas;
        let mut shards = Vec::with_capacity(replicas);
        let mut start = 0;
        for r in 0..replicas {
            let len = base + usize::from(r < rem);
            if len > 0 {
                shards.push(start..start + len);
            }
            start += len;
        }
        Self { batch_len, shards }
    }

    pub fn batch_len(&self) -> usize {
        self.batch_len
    }

    pub fn shards(&self) -> &[Range<usize>] {
        &self.shards
    }
}

/// What a replica knows about itself while running a step
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    pub replica_id: usize,
    pub num_replicas_in_sync: usize,
    pub device: Device,
    pub shard: Range<usize>,
}

pub trait Strategy: Send + Sync {
    fn devices(&self) -> &[Device];

    fn num_replicas_in_sync(&self) -> usize {
        self.devices().len()
    }

    /// Runs `step` once per shard of `plan`, returning the per-replica results
    /// in replica order. Any replica error fails the whole step.
    fn run<R, F>(&self, plan: &ShardPlan, batch: &Batch, step: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(ReplicaContext, Batch) -> Result<R> + Sync;
}

fn check_plan(plan: &ShardPlan, batch: &Batch, devices: &[Device]) -> Result<()> {
    if plan.batch_len() != batch.len() {
        return Err(Error::msg(format!(
            "shard plan covers {} examples but the batch has {}",
            plan.batch_len(),
            batch.len()
        )));
    }
    if plan.shards().len() > devices.len() {
        return Err(Error::msg(format!(
            "{} shards planned for {} devices",
            plan.shards().len(),
            devices.len()
        )));
    }
    Ok(())
}

fn context(devices: &[Device], replica_id: usize, shard: &Range<usize>) -> ReplicaContext {
    ReplicaContext {
        replica_id,
        num_replicas_in_sync: devices.len(),
        device: devices[replica_id].clone(),
        shard: shard.clone(),
    }
}

/// A single replica, run on the calling thread
pub struct OneDevice {
    devices: Vec<Device>,
}

impl OneDevice {
    pub fn new(device: Device) -> Self {
        Self { devices: vec![device] }
    }
}

impl Default for OneDevice {
    fn default() -> Self {
        Self::new(Device::cpu(0))
    }
}

impl Strategy for OneDevice {
    fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn run<R, F>(&self, plan: &ShardPlan, batch: &Batch, step: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(ReplicaContext, Batch) -> Result<R> + Sync,
    {
        check_plan(plan, batch, &self.devices)?;
        plan.shards()
            .iter()
            .enumerate()
            .map(|(i, shard)| step(context(&self.devices, i, shard), batch.shard(shard.clone())))
            .collect()
    }
}

/// Synchronous data parallelism, one scoped worker thread per replica
pub struct Mirrored {
    devices: Vec<Device>,
}

impl Mirrored {
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::msg("mirrored strategy needs at least one device"));
        }
        Ok(Self { devices })
    }

    /// `n` cpu replicas
    pub fn with_cpus(n: usize) -> Result<Self> {
        Self::new((0..n).map(Device::cpu).collect())
    }
}

impl Strategy for Mirrored {
    fn devices(&self) -> &[Device] {
        &self.devices
    }

    fn run<R, F>(&self, plan: &ShardPlan, batch: &Batch, step: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(ReplicaContext, Batch) -> Result<R> + Sync,
    {
        check_plan(plan, batch, &self.devices)?;
        let step = &step;
        let joined = crossbeam::thread::scope(|s| {
            let handles: Vec<_> = plan
                .shards()
                .iter()
                .enumerate()
                .map(|(i, shard)| {
                    let ctx = context(&self.devices, i, shard);
                    let shard = batch.shard(shard.clone());
                    s.spawn(move |_| {
                        trace!(replica = i, device = %ctx.device, examples = shard.len(), "replica step");
                        step(ctx, shard)
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(i, h)| h.join().map_err(|_| Error::msg(format!("replica {i} panicked")))?)
                .collect::<Result<Vec<R>>>()
        });
        joined.map_err(|_| Error::msg("a replica thread panicked"))?
    }
}

/// Mean of per-replica gradients weighted by each replica's share of the batch
pub fn reduce_mean(replicas: Vec<(Gradients, usize)>) -> Result<Gradients> {
    let total: usize = replicas.iter().map(|(_, n)| n).sum();
    let mut iter = replicas.into_iter();
    let (first, n) = iter.next().ok_or_else(|| Error::msg("no replica gradients to reduce"))?;
    if total == 0 {
        return Err(Error::msg("replica gradients cover no examples"));
    }
    let mut acc = first;
    let scale = n as f32 / total as f32;
    acc.iter_mut().for_each(|g| *g *= scale);
    for (g, n) in iter {
        acc.add_scaled(&g, n as f32 / total as f32)?;
    }
    Ok(acc)
}

/// Mean of per-replica batch moments, weighted like `reduce_mean`. Each
/// replica normalizes with its own shard's moments, the variances are averaged
/// as they are and not pooled.
pub fn reduce_statistics(replicas: Vec<(BatchStatistics, usize)>) -> Result<BatchStatistics> {
    let total: usize = replicas.iter().map(|(_, n)| n).sum();
    let mut iter = replicas.into_iter();
    let (mut acc, n) = iter.next().ok_or_else(|| Error::msg("no replica statistics to reduce"))?;
    if total == 0 {
        return Err(Error::msg("replica statistics cover no examples"));
    }
    let scale = n as f32 / total as f32;
    for (mean, variance) in acc.iter_mut() {
        *mean *= scale;
        *variance *= scale;
    }
    for (stats, n) in iter {
        if stats.len() != acc.len() {
            return Err(Error::msg(format!("replicas report {} and {} batch moments", acc.len(), stats.len())));
        }
        let scale = n as f32 / total as f32;
        for ((mean, variance), (m, v)) in acc.iter_mut().zip(stats.iter()) {
            if mean.len() != m.len() || variance.len() != v.len() {
                return Err(Error::msg("replica batch moments differ in length"));
            }
            mean.scaled_add(scale, m);
            variance.scaled_add(scale, v);
        }
    }
    Ok(acc)
}

#[cfg(test)]
fn numbered_batch(n: usize) -> Batch {
    let images = ndarray::Array4::from_shape_fn((n, 1, 1, 1), |(i, _, _, _)| i as f32);
    Batch::new(images, (0..n as u32).collect()).unwrap()
}

#[test]
fn test_shard_plan() {
    assert_eq!(ShardPlan::new(7, 3).shards(), &[0..3, 3..5, 5..7]);
    assert_eq!(ShardPlan::new(2, 4).shards(), &[0..1, 1..2]);
    assert_eq!(ShardPlan::new(4, 1).shards(), &[0..4]);
    assert!(ShardPlan::new(0, 2).shards().is_empty());
}

#[test]
fn test_mirrored_matches_one_device() {
    let batch = numbered_batch(7);
    let step = |ctx: ReplicaContext, b: Batch| -> Result<(usize, f32)> {
        assert_eq!(ctx.shard.len(), b.len());
        Ok((ctx.replica_id, b.images.sum()))
    };

    let mirrored = Mirrored::with_cpus(3).unwrap();
    let out = mirrored.run(&ShardPlan::new(7, 3), &batch, step).unwrap();
    assert_eq!(out, vec![(0, 3.0), (1, 7.0), (2, 11.0)]);

    let one = OneDevice::default();
    let out = one.run(&ShardPlan::new(7, 1), &batch, step).unwrap();
    assert_eq!(out, vec![(0, 21.0)]);
    assert_eq!(mirrored.devices()[2].name, "/device:CPU:2");
}

#[test]
fn test_replica_failure_propagates() {
    let batch = numbered_batch(4);
    let mirrored = Mirrored::with_cpus(2).unwrap();
    let plan = ShardPlan::new(4, 2);

    let failing = |ctx: ReplicaContext, _: Batch| -> Result<()> {
        if ctx.replica_id == 1 {
            return Err(Error::msg("bad replica"));
        }
        Ok(())
    };
    assert!(mirrored.run(&plan, &batch, failing).is_err());

    let panicking = |ctx: ReplicaContext, _: Batch| -> Result<()> {
        if ctx.replica_id == 0 {
            panic!("replica blew up");
        }
        Ok(())
    };
    assert!(mirrored.run(&plan, &batch, panicking).is_err());

    // plan built for another batch size
    assert!(mirrored.run(&ShardPlan::new(3, 2), &batch, |_, _| Ok(())).is_err());
    assert!(Mirrored::with_cpus(0).is_err());
}

#[test]
fn test_reduce_mean_weights_by_shard() {
    let a = Gradients(vec![ndarray::arr1(&[3.0f32]).into_dyn()]);
    let b = Gradients(vec![ndarray::arr1(&[0.0f32]).into_dyn()]);
    let mean = reduce_mean(vec![(a, 2), (b, 1)]).unwrap();
    assert_eq!(mean[0][[0]], 2.0);
    assert!(reduce_mean(vec![]).is_err());
}

#[test]
fn test_reduce_statistics_weights_by_shard() {
    use ndarray::arr1;
    let a = BatchStatistics(vec![(arr1(&[3.0f32, 0.0]), arr1(&[1.0f32, 2.0]))]);
    let b = BatchStatistics(vec![(arr1(&[0.0f32, 3.0]), arr1(&[4.0f32, 2.0]))]);
    let mean = reduce_statistics(vec![(a.clone(), 2), (b, 1)]).unwrap();
    assert_eq!(mean[0].0, arr1(&[2.0, 1.0]));
    assert_eq!(mean[0].1, arr1(&[2.0, 2.0]));

    // models without normalization report nothing
    let empty = reduce_statistics(vec![(BatchStatistics::default(), 2), (BatchStatistics::default(), 2)]).unwrap();
    assert!(empty.is_empty());
    assert!(reduce_statistics(vec![(a, 1), (BatchStatistics::default(), 1)]).is_err());
    assert!(reduce_statistics(vec![]).is_err());
}

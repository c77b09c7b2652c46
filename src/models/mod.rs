use anyhow::{Error, Result};
use derive_more::{Deref, DerefMut};
use ndarray::prelude::*;
use rand::rngs::StdRng;

use crate::nn::Float;

pub mod densenet;

pub use densenet::{DenseNet, DenseNetParams};

/// One gradient array per trainable parameter, in the order the model
/// visits its parameters
#[derive(Clone, Debug, Deref, DerefMut)]
pub struct Gradients<A = f32>(pub Vec<ArrayD<A>>);

impl<A: Float> Gradients<A> {
    pub fn zeros_like(shapes: &[Vec<usize>]) -> Self {
        Gradients(shapes.iter().map(|s| ArrayD::zeros(IxDyn(s))).collect())
    }

    /// `self += other * scale`
    pub fn add_scaled(&mut self, other: &Gradients<A>, scale: A) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::msg(format!(
                "cannot add {} gradients to {}",
                other.len(),
                self.len()
            )));
        }
        for (i, (a, b)) in self.iter_mut().zip(other.iter()).enumerate() {
            if a.shape() != b.shape() {
                return Err(Error::msg(format!(
                    "gradient {i} has shape {:?}, expected {:?}",
                    b.shape(),
                    a.shape()
                )));
            }
            a.scaled_add(scale, b);
        }
        Ok(())
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.iter().map(|g| g.shape().to_vec()).collect()
    }
}

/// Batch mean and variance of every normalization layer, in layer order.
/// Empty when the forward pass did not run in training mode.
#[derive(Clone, Debug, Deref, DerefMut)]
pub struct BatchStatistics<A = f32>(pub Vec<(Array1<A>, Array1<A>)>);

impl<A> Default for BatchStatistics<A> {
    fn default() -> Self {
        BatchStatistics(Vec::new())
    }
}

/// A trainable function from a batch of images to class logits.
///
/// Parameters are only read by `forward`/`backward`, which take `&self` so that
/// replicas can share one model across threads. Mutation goes through
/// `visit_params_mut`, used by the optimizer.
pub trait Model: Send + Sync {
    /// whatever the forward pass keeps around for the backward pass
    type Cache: Send;

    /// `training` enables dropout and normalizes by batch moments instead of
    /// the moving ones
    fn forward(&self, images: ArrayView4<f32>, training: bool, rng: &mut StdRng) -> Result<(Array2<f32>, Self::Cache)>;

    /// Gradients of the parameters given the gradient of the logits
    fn backward(&self, cache: Self::Cache, grad_logits: ArrayView2<f32>) -> Gradients;

    /// Auxiliary loss terms owned by the model, eg. weight decay
    fn losses(&self) -> Vec<f32>;

    /// Adds the gradient of `sum(self.losses())` into `grads`
    fn add_loss_gradients(&self, grads: &mut Gradients);

    /// Batch moments the forward pass normalized with
    fn batch_statistics(&self, _cache: &Self::Cache) -> BatchStatistics {
        BatchStatistics::default()
    }

    /// Folds replica averaged batch moments into the moving moments used at
    /// inference. Not a gradient update, so the optimizer never sees them.
    fn update_moving_statistics(&mut self, _stats: &BatchStatistics) -> Result<()> {
        Ok(())
    }

    fn visit_params(&self, f: &mut dyn FnMut(&str, ArrayViewD<f32>));

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<f32>));

    fn param_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = Vec::new();
        self.visit_params(&mut |_, p| shapes.push(p.shape().to_vec()));
        shapes
    }

    fn num_params(&self) -> usize {
        let mut n = 0;
        self.visit_params(&mut |_, p| n += p.len());
        n
    }

    /// Copy of every parameter, keyed by path
    fn snapshot(&self) -> Vec<(String, ArrayD<f32>)> {
        let mut params = Vec::new();
        self.visit_params(&mut |path, p| params.push((path.to_string(), p.to_owned())));
        params
    }
}

#[test]
fn test_gradients_add_scaled() {
    let mut a = Gradients::<f32>::zeros_like(&[vec![2, 2], vec![3]]);
    let mut b = a.clone();
    b[0].fill(1.0);
    b[1].fill(2.0);
    a.add_scaled(&b, 0.5).unwrap();
    a.add_scaled(&b, 0.5).unwrap();
    assert!(a[0].iter().all(|x| *x == 1.0));
    assert!(a[1].iter().all(|x| *x == 2.0));

    let wrong = Gradients::<f32>::zeros_like(&[vec![2, 2], vec![4]]);
    assert!(a.add_scaled(&wrong, 1.0).is_err());
    assert!(a.add_scaled(&Gradients(vec![]), 1.0).is_err());
    assert_eq!(a.shapes(), vec![vec![2, 2], vec![3]]);
}

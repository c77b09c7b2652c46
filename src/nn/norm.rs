use ndarray::prelude::*;
use ndarray::Zip;

use super::{cast, Float};

pub const MOMENTUM: f64 = 0.99;
pub const EPSILON: f64 = 1.001e-5;

/// Batch normalization over the batch axis of a [batch, features] activation.
/// Training normalizes with the batch moments, inference with the moving ones.
pub struct BatchNorm<T: Float> {
    pub gamma: Array1<T>,
    pub beta: Array1<T>,
    pub moving_mean: Array1<T>,
    pub moving_variance: Array1<T>,
    pub momentum: T,
    pub epsilon: T,
}

pub struct BatchNormCache<T> {
    xhat: Array2<T>,
    inv_std: Array1<T>,
    training: bool,
    /// moments used for normalizing, the batch ones when training
    pub mean: Array1<T>,
    pub variance: Array1<T>,
}

pub struct BatchNormGrads<T> {
    pub dgamma: Array1<T>,
    pub dbeta: Array1<T>,
}

/// Per column mean and population variance
pub fn moments<T: Float>(x: &ArrayView2<T>) -> (Array1<T>, Array1<T>) {
    let n: T = cast(x.nrows().max(1));
    let mean = x.sum_axis(Axis(0)).mapv(|s| s / n);
    let mut variance = Array1::zeros(x.ncols());
    for row in x.rows() {
        Zip::from(&mut variance)
            .and(&row)
            .and(&mean)
            .for_each(|v, x, m| *v += (*x - *m) * (*x - *m));
    }
    variance.mapv_inplace(|v| v / n);
    (mean, variance)
}

impl<T: Float> BatchNorm<T> {
    /// unit scale, zero shift, moving moments at (0, 1)
    pub fn new(features: usize) -> Self {
        Self {
            gamma: Array1::ones(features),
            beta: Array1::zeros(features),
            moving_mean: Array1::zeros(features),
            moving_variance: Array1::ones(features),
            momentum: cast(MOMENTUM),
            epsilon: cast(EPSILON),
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, x: &ArrayView2<T>, training: bool) -> (Array2<T>, BatchNormCache<T>) {
        let (mean, variance) = if training {
            moments(x)
        } else {
            (self.moving_mean.clone(), self.moving_variance.clone())
        };
        let eps = self.epsilon;
        let inv_std = variance.mapv(|v| (v + eps).sqrt().recip());
        let xhat = Zip::from(x)
            .and_broadcast(&mean)
            .and_broadcast(&inv_std)
            .map_collect(|x, m, s| (*x - *m) * *s);
        let y = Zip::from(&xhat)
            .and_broadcast(&self.gamma)
            .and_broadcast(&self.beta)
            .map_collect(|x, g, b| *x * *g + *b);
        (y, BatchNormCache { xhat, inv_std, training, mean, variance })
    }

    /// Gradient of the input and of gamma/beta. In training mode the batch
    /// moments depend on the input, so their contribution is included.
    pub fn backward(&self, cache: &BatchNormCache<T>, grad: &ArrayView2<T>) -> (Array2<T>, BatchNormGrads<T>) {
        let dbeta = grad.sum_axis(Axis(0));
        let dgamma = (grad * &cache.xhat).sum_axis(Axis(0));
        let dxhat = grad * &self.gamma;

        let dx = if cache.training {
            let n: T = cast(grad.nrows().max(1));
            let sum_d = dxhat.sum_axis(Axis(0));
            let sum_dx = (&dxhat * &cache.xhat).sum_axis(Axis(0));
            Zip::from(&dxhat)
                .and(&cache.xhat)
                .and_broadcast(&cache.inv_std)
                .and_broadcast(&sum_d)
                .and_broadcast(&sum_dx)
                .map_collect(|d, xh, s, sd, sdx| *s / n * (n * *d - *sd - *xh * *sdx))
        } else {
            &dxhat * &cache.inv_std
        };
        (dx, BatchNormGrads { dgamma, dbeta })
    }

    /// `moving = momentum * moving + (1 - momentum) * batch`
    pub fn update_moving(&mut self, mean: &ArrayView1<T>, variance: &ArrayView1<T>) {
        let mu = self.momentum;
        let keep = T::one() - mu;
        Zip::from(&mut self.moving_mean)
            .and(mean)
            .for_each(|m, b| *m = mu * *m + keep * *b);
        Zip::from(&mut self.moving_variance)
            .and(variance)
            .for_each(|v, b| *v = mu * *v + keep * *b);
    }
}

#[cfg(test)]
fn fixed_norm() -> BatchNorm<f64> {
    let mut bn = BatchNorm::new(3);
    bn.gamma = array![1.5, -0.5, 0.8];
    bn.beta = array![0.1, 0.2, -0.3];
    bn.moving_mean = array![0.5, -1.0, 0.0];
    bn.moving_variance = array![2.0, 0.5, 1.0];
    bn
}

#[cfg(test)]
fn wavy(rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| ((i * cols + j) as f64 * 1.7).sin() * (1.0 + j as f64))
}

#[test]
fn test_batchnorm_input_grad() {
    use super::grad_check;
    let bn = fixed_norm();
    let x0 = wavy(5, 3);
    for training in [true, false] {
        let f = |x: &Array1<f64>| {
            let x = x.clone().into_shape((5, 3)).unwrap();
            bn.forward(&x.view(), training).0.into_shape(15).unwrap()
        };
        let (_, cache) = bn.forward(&x0.view(), training);
        let df = |g: &Array1<f64>| {
            let g = g.clone().into_shape((5, 3)).unwrap();
            bn.backward(&cache, &g.view()).0.into_shape(15).unwrap()
        };
        grad_check(x0.clone().into_shape(15).unwrap(), f, df, None, None, None).unwrap();
    }
}

#[test]
fn test_batchnorm_param_grad() {
    use super::grad_check;
    let x = wavy(4, 3);
    // gamma and beta packed into one vector
    let f = |p: &Array1<f64>| {
        let mut bn = fixed_norm();
        bn.gamma = p.slice(s![..3]).to_owned();
        bn.beta = p.slice(s![3..]).to_owned();
        bn.forward(&x.view(), true).0.into_shape(12).unwrap()
    };
    let bn = fixed_norm();
    let (_, cache) = bn.forward(&x.view(), true);
    let df = |g: &Array1<f64>| {
        let g = g.clone().into_shape((4, 3)).unwrap();
        let (_, grads) = bn.backward(&cache, &g.view());
        ndarray::concatenate![Axis(0), grads.dgamma, grads.dbeta]
    };
    let p0 = ndarray::concatenate![Axis(0), bn.gamma, bn.beta];
    grad_check(p0, f, df, None, None, None).unwrap();
}

#[test]
fn test_batchnorm_training_standardizes() {
    let bn = BatchNorm::<f64>::new(3);
    let x = wavy(8, 3) * 4.0 + 2.5;
    let (y, cache) = bn.forward(&x.view(), true);
    let (mean, variance) = moments(&y.view());
    for (m, v) in mean.iter().zip(variance.iter()) {
        approx::assert_abs_diff_eq!(*m, 0.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-3);
    }
    let (batch_mean, _) = moments(&x.view());
    assert_eq!(cache.mean, batch_mean);
}

#[test]
fn test_batchnorm_inference_uses_moving_moments() {
    let bn = fixed_norm();
    let x = wavy(4, 3);
    let (y, _) = bn.forward(&x.view(), false);
    for ((i, j), v) in y.indexed_iter() {
        let expected = (x[[i, j]] - bn.moving_mean[j]) / (bn.moving_variance[j] + EPSILON).sqrt() * bn.gamma[j] + bn.beta[j];
        approx::assert_abs_diff_eq!(*v, expected, epsilon = 1e-12);
    }
    // rows do not interact
    let (row, _) = bn.forward(&x.slice(s![1..2, ..]), false);
    for (a, b) in row.iter().zip(y.row(1).iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_update_moving() {
    let mut bn = BatchNorm::<f64>::new(2);
    bn.update_moving(&array![1.0, -2.0].view(), &array![3.0, 0.0].view());
    let expected = [(0.01, 1.02), (-0.02, 0.99)];
    for (j, (m, v)) in expected.into_iter().enumerate() {
        approx::assert_abs_diff_eq!(bn.moving_mean[j], m, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(bn.moving_variance[j], v, epsilon = 1e-12);
    }
}

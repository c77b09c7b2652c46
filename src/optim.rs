use anyhow::{Error, Result};
use ndarray::prelude::*;
use ndarray::Zip;
use tracing::debug;

use crate::models::{Gradients, Model};

/// Stochastic gradient descent with (nesterov) momentum.
///
/// With velocity `v`, gradient `g` and learning rate `lr`:
/// `v = momentum * v - lr * g`, then `w += v` or, with nesterov,
/// `w += momentum * v - lr * g`.
pub struct Sgd {
    learning_rate: f64,
    pub momentum: f32,
    pub nesterov: bool,
    /// one slot per parameter, created on first use
    velocities: Vec<Option<ArrayD<f32>>>,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f32, nesterov: bool) -> Self {
        Self { learning_rate, momentum, nesterov, velocities: Vec::new() }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_lr(&mut self, lr: f64) {
        if lr != self.learning_rate {
            debug!(from = self.learning_rate, to = lr, "learning rate changed");
        }
        self.learning_rate = lr;
    }

    /// Applies one update to every parameter of `model`. Nothing is written
    /// unless all gradient shapes match the parameters.
    pub fn apply_gradients<M: Model + ?Sized>(&mut self, model: &mut M, grads: &Gradients) -> Result<()> {
        let shapes = model.param_shapes();
        if shapes.len() != grads.len() {
            return Err(Error::msg(format!(
                "model has {} parameters but {} gradients were given",
                shapes.len(),
                grads.len()
            )));
        }
        for (i, (s, g)) in shapes.iter().zip(grads.iter()).enumerate() {
            if s.as_slice() != g.shape() {
                return Err(Error::msg(format!(
                    "gradient {i} has shape {:?}, parameter has shape {s:?}",
                    g.shape()
                )));
            }
        }
        if self.velocities.len() != grads.len() {
            self.velocities = vec![None; grads.len()];
        }

        let lr = self.learning_rate as f32;
        let mu = self.momentum;
        let nesterov = self.nesterov;
        let mut i = 0;
        let velocities = &mut self.velocities;
        model.visit_params_mut(&mut |_, mut w| {
            let g = &grads[i];
            if mu == 0.0 {
                w.scaled_add(-lr, g);
            } else {
                let v = velocities[i].get_or_insert_with(|| ArrayD::zeros(g.raw_dim()));
                v.zip_mut_with(g, |v, g| *v = mu * *v - lr * *g);
                if nesterov {
                    Zip::from(&mut w).and(&*v).and(g).for_each(|w, v, g| *w += mu * *v - lr * *g);
                } else {
                    w += &*v;
                }
            }
            i += 1;
        });
        Ok(())
    }
}

#[cfg(test)]
struct Scalar(ArrayD<f32>);

#[cfg(test)]
impl Model for Scalar {
    type Cache = ();

    fn forward(&self, images: ArrayView4<f32>, _: bool, _: &mut rand::rngs::StdRng) -> Result<(Array2<f32>, ())> {
        Ok((Array2::zeros((images.len_of(Axis(0)), 1)), ()))
    }

    fn backward(&self, _: (), _: ArrayView2<f32>) -> Gradients {
        Gradients(vec![ArrayD::zeros(self.0.raw_dim())])
    }

    fn losses(&self) -> Vec<f32> {
        Vec::new()
    }

    fn add_loss_gradients(&self, _: &mut Gradients) {}

    fn visit_params(&self, f: &mut dyn FnMut(&str, ArrayViewD<f32>)) {
        f("w", self.0.view())
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<f32>)) {
        f("w", self.0.view_mut())
    }
}

#[test]
fn test_nesterov_closed_form() {
    use approx::assert_abs_diff_eq;
    let mut model = Scalar(arr1(&[1.0f32]).into_dyn());
    let mut sgd = Sgd::new(0.1, 0.9, true);
    let g = Gradients(vec![arr1(&[0.5f32]).into_dyn()]);

    // v1 = -0.05, w1 = 1 + 0.9 * -0.05 - 0.05
    sgd.apply_gradients(&mut model, &g).unwrap();
    assert_abs_diff_eq!(model.0[[0]], 0.905, epsilon = 1e-6);
    // v2 = 0.9 * -0.05 - 0.05 = -0.095, w2 = w1 + 0.9 * -0.095 - 0.05
    sgd.apply_gradients(&mut model, &g).unwrap();
    assert_abs_diff_eq!(model.0[[0]], 0.7695, epsilon = 1e-6);
}

#[test]
fn test_plain_momentum_and_sgd() {
    use approx::assert_abs_diff_eq;
    let g = Gradients(vec![arr1(&[1.0f32, -2.0]).into_dyn()]);

    let mut model = Scalar(arr1(&[0.0f32, 0.0]).into_dyn());
    let mut sgd = Sgd::new(0.1, 0.0, false);
    sgd.apply_gradients(&mut model, &g).unwrap();
    assert_abs_diff_eq!(model.0[[1]], 0.2, epsilon = 1e-6);

    let mut model = Scalar(arr1(&[0.0f32, 0.0]).into_dyn());
    let mut sgd = Sgd::new(0.1, 0.5, false);
    sgd.apply_gradients(&mut model, &g).unwrap();
    sgd.apply_gradients(&mut model, &g).unwrap();
    // -0.1 then -0.15
    assert_abs_diff_eq!(model.0[[0]], -0.25, epsilon = 1e-6);
}

#[test]
fn test_shape_mismatch_leaves_params() {
    let mut model = Scalar(arr1(&[1.0f32, 2.0]).into_dyn());
    let mut sgd = Sgd::new(0.1, 0.9, true);
    let g = Gradients(vec![arr1(&[1.0f32]).into_dyn()]);
    assert!(sgd.apply_gradients(&mut model, &g).is_err());
    assert!(sgd.apply_gradients(&mut model, &Gradients(vec![])).is_err());
    assert_eq!(model.0, arr1(&[1.0f32, 2.0]).into_dyn());
}

#[test]
fn test_set_lr() {
    let mut sgd = Sgd::new(0.1, 0.9, true);
    sgd.set_lr(0.01);
    assert_eq!(sgd.learning_rate(), 0.01);
}

use anyhow::{Error, Result};
use ndarray::prelude::*;

use super::{cast, Float};

/// Row-wise log-softmax over the class axis of a [batch, classes] array
pub fn log_softmax<T: Float>(logits: &ArrayView2<T>) -> Array2<T> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(T::neg_infinity(), |m, x| m.max(*x));
        let lse = row.fold(T::zero(), |acc, x| acc + (*x - max).exp()).ln() + max;
        row.mapv_inplace(|x| x - lse);
    }
    out
}

/// Cross-entropy between integer labels and class scores, averaged over the batch.
///
/// With `from_logits` the scores are unnormalized logits, otherwise they are
/// expected to already be probabilities.
#[derive(Clone, Copy, Debug)]
pub struct SparseCategoricalCrossentropy {
    pub from_logits: bool,
}

impl Default for SparseCategoricalCrossentropy {
    fn default() -> Self {
        Self { from_logits: true }
    }
}

const PROB_EPSILON: f64 = 1e-7;

impl SparseCategoricalCrossentropy {
    pub fn new(from_logits: bool) -> Self {
        Self { from_logits }
    }

    fn check(labels: &[u32], scores: &ArrayView2<impl Float>) -> Result<()> {
        let (n, classes) = scores.dim();
        if labels.len() != n {
            return Err(Error::msg(format!(
                "got {} labels for a batch of {} predictions",
                labels.len(),
                n
            )));
        }
        if let Some(l) = labels.iter().find(|l| **l as usize >= classes) {
            return Err(Error::msg(format!("label {l} out of range for {classes} classes")));
        }
        Ok(())
    }

    /// Mean loss over the batch
    pub fn call<T: Float>(&self, labels: &[u32], scores: &ArrayView2<T>) -> Result<T> {
        Ok(self.forward(labels, scores)?.0)
    }

    /// Mean loss over the batch together with its gradient w.r.t. `scores`
    pub fn forward<T: Float>(&self, labels: &[u32], scores: &ArrayView2<T>) -> Result<(T, Array2<T>)> {
        Self::check(labels, scores)?;
        let n = labels.len();
        if n == 0 {
            return Ok((T::zero(), Array2::zeros(scores.raw_dim())));
        }
        let inv_n: T = cast(1.0 / n as f64);

        if self.from_logits {
            let logp = log_softmax(scores);
            let mut loss = T::zero();
            let mut grad = logp.mapv(|x| x.exp());
            for (i, l) in labels.iter().enumerate() {
                let l = *l as usize;
                loss = loss - logp[[i, l]];
                grad[[i, l]] = grad[[i, l]] - T::one();
            }
            grad.mapv_inplace(|g| g * inv_n);
            Ok((loss * inv_n, grad))
        } else {
            let eps: T = cast(PROB_EPSILON);
            let upper = T::one() - eps;
            let mut loss = T::zero();
            let mut grad = Array2::zeros(scores.raw_dim());
            for (i, l) in labels.iter().enumerate() {
                let l = *l as usize;
                let p = scores[[i, l]].max(eps).min(upper);
                loss = loss - p.ln();
                grad[[i, l]] = -inv_n / p;
            }
            Ok((loss * inv_n, grad))
        }
    }
}

#[test]
fn test_cross_entropy_grad() {
    use super::grad_check;
    let labels = [2u32, 0];
    let ce = SparseCategoricalCrossentropy::default();
    let f = |x: &Array1<f64>| {
        let logits = x.clone().into_shape((2, 3)).unwrap();
        array![ce.call(&labels, &logits.view()).unwrap()]
    };
    let x0 = array![0.2, -1.0, 1.4, 2.1, 0.3, -0.7];
    let df = |g: &Array1<f64>| {
        let logits = x0.clone().into_shape((2, 3)).unwrap();
        let (_, grad) = ce.forward(&labels, &logits.view()).unwrap();
        (grad * g[0]).into_shape(6).unwrap()
    };
    grad_check(x0.clone(), f, df, None, None, None).unwrap();
}

#[test]
fn test_cross_entropy_uniform_logits() {
    use approx::assert_relative_eq;
    let logits = Array2::<f32>::zeros((4, 10));
    let loss = SparseCategoricalCrossentropy::default()
        .call(&[0, 3, 9, 5], &logits.view())
        .unwrap();
    assert_relative_eq!(loss, (10.0f32).ln(), epsilon = 1e-6);
}

#[test]
fn test_cross_entropy_from_probabilities() {
    use approx::assert_relative_eq;
    let probs = array![[0.25f64, 0.75], [0.5, 0.5]];
    let loss = SparseCategoricalCrossentropy::new(false)
        .call(&[1, 0], &probs.view())
        .unwrap();
    assert_relative_eq!(loss, -(0.75f64.ln() + 0.5f64.ln()) / 2.0, epsilon = 1e-12);
}

#[test]
fn test_cross_entropy_rejects_bad_labels() {
    let logits = Array2::<f32>::zeros((2, 3));
    let ce = SparseCategoricalCrossentropy::default();
    assert!(ce.call(&[0, 3], &logits.view()).is_err());
    assert!(ce.call(&[0], &logits.view()).is_err());
}

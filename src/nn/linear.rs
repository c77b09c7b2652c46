use ndarray::prelude::*;
use rand::Rng;
use rand_distr::StandardNormal;

use super::{cast, dmatmul, Float};

/// Fully connected layer, `y = x w + b`, with `x` of shape [batch, in_dim]
pub struct Linear<T: Float> {
    pub w: Array2<T>,
    pub b: Option<Array1<T>>,
}

pub struct LinearGrads<T> {
    pub dw: Array2<T>,
    pub db: Option<Array1<T>>,
}

impl<T: Float> Linear<T> {
    /// He-normal kernel, zero bias
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, bias: bool, rng: &mut R) -> Self {
        let std = (2.0 / in_dim.max(1) as f64).sqrt();
        let w = Array2::from_shape_simple_fn((in_dim, out_dim), || {
            let z: f64 = rng.sample(StandardNormal);
            cast(z * std)
        });
        let b = if bias { Some(Array1::zeros(out_dim)) } else { None };
        Self { w, b }
    }

    pub fn in_dim(&self) -> usize {
        self.w.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.w.ncols()
    }

    pub fn forward(&self, x: &ArrayView2<T>) -> Array2<T> {
        let y = x.dot(&self.w);
        match &self.b {
            Some(b) => y + b,
            None => y,
        }
    }

    /// Given the layer input and the gradient of its output, returns
    /// the gradient of the input and of the parameters
    pub fn backward(&self, x: &ArrayView2<T>, grad: &ArrayView2<T>) -> (Array2<T>, LinearGrads<T>) {
        let (dx, dw) = dmatmul(grad, x, &self.w.view());
        let db = self.b.as_ref().map(|_| grad.sum_axis(Axis(0)));
        (dx, LinearGrads { dw, db })
    }

    /// `sum(w^2)`, the kernel part of an l2 penalty
    pub fn kernel_sq_norm(&self) -> T {
        self.w.fold(T::zero(), |acc, x| acc + *x * *x)
    }
}

#[cfg(test)]
fn fixed_linear() -> Linear<f64> {
    Linear {
        w: array![[0.5, -1.0, 0.25], [1.5, 0.75, -0.5]],
        b: Some(array![0.1, -0.2, 0.3]),
    }
}

#[test]
fn test_linear_input_grad() {
    use super::grad_check;
    let layer = fixed_linear();
    let f = |x: &Array1<f64>| {
        let x = x.clone().into_shape((2, 2)).unwrap();
        layer.forward(&x.view()).into_shape(6).unwrap()
    };
    let df = |g: &Array1<f64>| {
        let g = g.clone().into_shape((2, 3)).unwrap();
        let x = Array2::<f64>::zeros((2, 2));
        let (dx, _) = layer.backward(&x.view(), &g.view());
        dx.into_shape(4).unwrap()
    };
    grad_check(array![0.3, -1.2, 2.0, 0.4], f, df, None, None, None).unwrap();
}

#[test]
fn test_linear_param_grad() {
    use super::grad_check;
    let x = array![[0.3, -1.2], [2.0, 0.4]];
    let f = |w: &Array1<f64>| {
        let mut layer = fixed_linear();
        layer.w = w.clone().into_shape((2, 3)).unwrap();
        layer.forward(&x.view()).into_shape(6).unwrap()
    };
    let df = |g: &Array1<f64>| {
        let g = g.clone().into_shape((2, 3)).unwrap();
        let (_, grads) = fixed_linear().backward(&x.view(), &g.view());
        grads.dw.into_shape(6).unwrap()
    };
    let w0 = fixed_linear().w.into_shape(6).unwrap();
    grad_check(w0, f, df, None, None, None).unwrap();

    let g = Array2::<f64>::ones((2, 3));
    let (_, grads) = fixed_linear().backward(&x.view(), &g.view());
    assert_eq!(grads.db.unwrap(), array![2.0, 2.0, 2.0]);
}

#[test]
fn test_linear_init_shapes() {
    use rand::{rngs::StdRng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(0);
    let layer = Linear::<f32>::new(12, 5, false, &mut rng);
    assert_eq!(layer.w.dim(), (12, 5));
    assert!(layer.b.is_none());
    assert!(layer.w.iter().all(|x| x.is_finite()));
}

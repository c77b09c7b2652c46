use anyhow::{Error, Result};
use ndarray as nd;
use nd::prelude::*;
use num_traits::NumCast;

use super::Float;

/// Gradient of `a.dot(b)` given the gradient of its output
pub fn dmatmul<T: Float>(grad: &ArrayView2<T>, a: &ArrayView2<T>, b: &ArrayView2<T>) -> (Array2<T>, Array2<T>) {
    let db = a.t().dot(grad);
    let da = grad.dot(&b.t());
    (da, db)
}

/// Lossy numeric conversion between element types, zero when unrepresentable
pub fn cast<A: NumCast, B: Float>(x: A) -> B {
    <B as NumCast>::from(x).unwrap_or_else(B::zero)
}

/// Checks the vector-jacobian product `df` of `f: R^n -> R^m` against central
/// differences, one output component at a time. Entries agree when
/// `|analytic - numeric| <= atol + rtol * |numeric|`.
/// Defaults: epsilon 1e-6, atol 1e-5, rtol 1e-3.
pub fn grad_check(
    input: Array1<f64>,
    f: impl Fn(&Array1<f64>) -> Array1<f64>,
    df: impl Fn(&Array1<f64>) -> Array1<f64>,
    epsilon: Option<f64>,
    atol: Option<f64>,
    rtol: Option<f64>,
) -> Result<()> {
    let eps = epsilon.unwrap_or(1e-6);
    let atol = atol.unwrap_or(1e-5);
    let rtol = rtol.unwrap_or(1e-3);
    let m = f(&input).len();

    for j in 0..m {
        let analytic = df(&Array1::from_shape_fn(m, |k| if k == j { 1.0 } else { 0.0 }));
        if analytic.len() != input.len() {
            return Err(Error::msg(format!("df returned {} entries for an input of {}", analytic.len(), input.len())));
        }
        let mut x = input.clone();
        for (i, a) in analytic.iter().enumerate() {
            x[i] = input[i] + eps;
            let up = f(&x)[j];
            x[i] = input[i] - eps;
            let down = f(&x)[j];
            x[i] = input[i];

            let numeric = (up - down) / (2.0 * eps);
            if (a - numeric).abs() > atol + rtol * numeric.abs() {
                return Err(Error::msg(format!("output {j}, input {i}: analytic {a}, numeric {numeric}")));
            }
        }
    }
    Ok(())
}

#[test]
fn test_dmatmul_grad() {
    let b = array![[0.5, -1.0, 2.0], [1.5, 0.25, -0.75]];
    let f = |x: &Array1<f64>| {
        let a = x.clone().into_shape((2, 2)).unwrap();
        a.dot(&b).into_shape(6).unwrap()
    };
    let df = |g: &Array1<f64>| {
        let g = g.clone().into_shape((2, 3)).unwrap();
        let a = Array2::<f64>::zeros((2, 2));
        let (da, _) = dmatmul(&g.view(), &a.view(), &b.view());
        da.into_shape(4).unwrap()
    };
    grad_check(array![1.0, -2.0, 0.3, 0.7], f, df, None, None, None).unwrap();
}

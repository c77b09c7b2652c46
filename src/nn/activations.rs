use ndarray::prelude::*;
use ndarray::Zip;
use rand::Rng;

use super::{cast, Float};

pub fn relu<T: Float, D: Dimension>(x: &ArrayView<T, D>) -> Array<T, D> {
    x.mapv(|v| v.max(T::zero()))
}

/// gradient of relu w.r.t. its pre-activation `x`
pub fn drelu<T: Float, D: Dimension>(x: &ArrayView<T, D>, grad: &ArrayView<T, D>) -> Array<T, D> {
    Zip::from(x)
        .and(grad)
        .map_collect(|x, g| if *x > T::zero() { *g } else { T::zero() })
}

/// Inverted dropout mask, each entry is either 0 or 1 / (1 - rate)
pub fn dropout_mask<T: Float, R: Rng + ?Sized>(shape: (usize, usize), rate: f32, rng: &mut R) -> Array2<T> {
    let keep = 1.0 - rate.clamp(0.0, 1.0);
    if keep <= 0.0 {
        return Array2::zeros(shape);
    }
    let scale: T = cast(1.0 / keep);
    Array2::from_shape_simple_fn(shape, || {
        if rng.gen::<f32>() < keep {
            scale
        } else {
            T::zero()
        }
    })
}

#[test]
fn test_relu_grad() {
    use super::grad_check;
    let x0 = array![0.5, -1.5, 2.0, -0.3, 0.9];
    let f = |x: &Array1<f64>| relu(&x.view());
    let df = |g: &Array1<f64>| drelu(&x0.view(), &g.view());
    grad_check(x0.clone(), f, df, None, None, None).unwrap();
}

#[test]
fn test_dropout_mask_values() {
    use rand::{rngs::StdRng, SeedableRng};
    let mut rng = StdRng::seed_from_u64(7);
    let mask: Array2<f32> = dropout_mask((64, 32), 0.25, &mut rng);
    assert!(mask.iter().all(|m| *m == 0.0 || (*m - 1.0 / 0.75).abs() < 1e-6));
    let kept = mask.iter().filter(|m| **m > 0.0).count() as f32 / mask.len() as f32;
    assert!((kept - 0.75).abs() < 0.05, "kept fraction {kept}");

    let none: Array2<f32> = dropout_mask((4, 4), 0.0, &mut rng);
    assert!(none.iter().all(|m| *m == 1.0));
}

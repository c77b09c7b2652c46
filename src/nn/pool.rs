use ndarray::prelude::*;

use super::{cast, Float};

/// 2x2 average pooling with stride 2 over the two spatial axes of a 4d batch.
/// Odd trailing rows/columns are dropped.
pub fn avg_pool2x2<T: Float>(x: &ArrayView4<T>, spatial: [usize; 2]) -> Array4<T> {
    let [h_axis, w_axis] = spatial;
    let mut out_dim = x.raw_dim();
    out_dim[h_axis] = x.len_of(Axis(h_axis)) / 2;
    out_dim[w_axis] = x.len_of(Axis(w_axis)) / 2;
    let quarter: T = cast(0.25);

    Array4::from_shape_fn(out_dim, |(a, b, c, d)| {
        let mut acc = T::zero();
        for dy in 0..2 {
            for dx in 0..2 {
                let mut idx = [a, b, c, d];
                idx[h_axis] = idx[h_axis] * 2 + dy;
                idx[w_axis] = idx[w_axis] * 2 + dx;
                acc = acc + x[idx];
            }
        }
        acc * quarter
    })
}

#[test]
fn test_avg_pool_channels_last() {
    let x = Array4::from_shape_fn((1, 4, 4, 2), |(_, h, w, c)| (h * 4 + w) as f32 + 100.0 * c as f32);
    let y = avg_pool2x2(&x.view(), [1, 2]);
    assert_eq!(y.dim(), (1, 2, 2, 2));
    // mean of 0, 1, 4, 5
    assert_eq!(y[[0, 0, 0, 0]], 2.5);
    assert_eq!(y[[0, 1, 1, 1]], 112.5);
}

#[test]
fn test_avg_pool_channels_first_odd() {
    let x = Array4::<f64>::ones((2, 3, 5, 5));
    let y = avg_pool2x2(&x.view(), [2, 3]);
    assert_eq!(y.dim(), (2, 3, 2, 2));
    assert!(y.iter().all(|v| *v == 1.0));
}

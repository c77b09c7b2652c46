use std::fmt::Debug;

use ndarray::{LinalgScalar, ScalarOperand};

pub mod activations;
pub mod linear;
pub mod loss;
pub mod norm;
pub mod pool;
pub mod utils;

pub use linear::Linear;
pub use loss::SparseCategoricalCrossentropy;
pub use norm::BatchNorm;
pub use utils::{cast, dmatmul, grad_check};

/// Element type of every op in this module. Ops are generic so that gradient
/// checks can run in f64 while training runs in f32.
pub trait Float:
    num_traits::Float
    + LinalgScalar
    + ScalarOperand
    + std::ops::AddAssign
    + Debug
    + Send
    + Sync
    + 'static {}

impl Float for f32 {}
impl Float for f64 {}

//! Loss capability.

use candle::{Result, Tensor};

/// `(predictions, targets) -> scalar loss`.
pub type LossFn = Box<dyn Fn(&Tensor, &Tensor) -> Result<Tensor>>;

pub fn mse() -> LossFn {
    Box::new(candle_nn::loss::mse)
}

/// Cross entropy over logits with `u32` class targets.
pub fn cross_entropy() -> LossFn {
    Box::new(candle_nn::loss::cross_entropy)
}

//! Optimizer capability and factories.

use candle::backprop::GradStore;
use candle::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

/// Object-safe view of an optimizer. Every `candle_nn::Optimizer` is one.
pub trait Optim {
    fn step(&mut self, grads: &GradStore) -> Result<()>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

impl<O: Optimizer> Optim for O {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        Optimizer::step(self, grads)
    }

    fn learning_rate(&self) -> f64 {
        Optimizer::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        Optimizer::set_learning_rate(self, lr)
    }
}

/// Builds a fresh optimizer from the model parameters and a learning rate.
pub type OptFn = Box<dyn Fn(Vec<Var>, f64) -> Result<Box<dyn Optim>>>;

pub fn sgd() -> OptFn {
    Box::new(|vars, lr| Ok(Box::new(SGD::new(vars, lr)?) as Box<dyn Optim>))
}

/// AdamW with `params`; its `lr` is replaced by the learner's.
pub fn adamw(params: ParamsAdamW) -> OptFn {
    Box::new(move |vars, lr| {
        let params = ParamsAdamW {
            lr,
            ..params.clone()
        };
        Ok(Box::new(AdamW::new(vars, params)?) as Box<dyn Optim>)
    })
}

//! Callback-driven training loop for Candle, in the spirit of the fastai `Learner`.
//!
//! The [`Learner`] owns the model, data, loss and optimizer and runs fit → epoch → batch.
//! Everything else (device placement, metrics, progress, schedules, mixed precision,
//! activation statistics) is a [`Callback`] reacting to [`Event`]s.

pub mod callbacks;
pub mod config;
pub mod data;
pub mod error;
pub mod hooks;
pub mod learner;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;

pub use callbacks::{callback, run_callbacks, Callback, CallbackRef, Event, Mode};
pub use config::FitConfig;
pub use data::{Batch, DataLoader, DataLoaders};
pub use error::{Cancel, Error, Result};
pub use hooks::{Activation, Hook, HookHandle, HookPoint, Hooks};
pub use learner::{BasicTrainStep, Learner, TrainStep};
pub use loss::LossFn;
pub use metrics::{Accuracy, Mean, Metric};
pub use model::{Model, Sequential};
pub use optim::{OptFn, Optim};

pub use candle::{Device, Module, Tensor};

#[cfg(test)]
pub(crate) mod testing {
    use crate::{Callback, DataLoaders, Event, Learner, Result, Sequential};
    use candle::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    /// Linear regression on CPU with `n_batches` identical batches in both loaders.
    pub fn tiny_learner(n_batches: usize) -> candle::Result<Learner> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Sequential::new(varmap).add("fc", candle_nn::linear(2, 1, vb.pp("fc"))?);

        let xs = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &device)?;
        let ys = Tensor::new(&[[1f32], [2.], [3.]], &device)?;
        let batches: Vec<crate::Batch> = (0..n_batches)
            .map(|_| crate::Batch::pair(xs.clone(), ys.clone()))
            .collect();
        let dls = DataLoaders::new(batches.clone(), batches);
        Ok(Learner::new(model, dls, crate::loss::mse(), 0.01, Vec::new()))
    }

    /// Records every event it sees.
    #[derive(Default)]
    pub struct Recorder {
        pub events: Vec<Event>,
    }

    impl Recorder {
        pub fn names(&self) -> Vec<&'static str> {
            self.events.iter().map(|e| e.name()).collect()
        }
    }

    impl Callback for Recorder {
        fn on_event(&mut self, event: Event, _learn: &mut Learner) -> Result<()> {
            self.events.push(event);
            Ok(())
        }
    }
}

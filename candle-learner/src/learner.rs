//! Training loop implementation.
//!
//! `fit` runs epochs, each epoch runs a training and a validation pass over batches, and every
//! level fires `before_*`, `after_*` and `cleanup_*` events around its body:
//!
//! * a cancellation of the level's own kind is caught, and `after_*` still fires;
//! * a cancellation of a broader kind, or any other error, skips `after_*` and propagates;
//! * `cleanup_*` fires on every path.

use crate::callbacks::{run_callbacks, CallbackRef, EpochLog, Event};
use crate::data::{Batch, DataLoader, DataLoaders};
use crate::loss::LossFn;
use crate::model::Model;
use crate::optim::{sgd, OptFn, Optim};
use crate::{Cancel, Error, FitConfig, Result};
use candle::backprop::GradStore;
use candle::Tensor;
use std::cell::Cell;
use std::ops::Range;
use std::rc::Rc;
use tracing::debug;

/// The numeric work of one batch. The learner only sequences these calls and fires events
/// between them; swapping the strategy changes how a step is computed, not when.
pub trait TrainStep {
    /// Sets `learn.preds`.
    fn predict(&self, learn: &mut Learner) -> Result<()>;

    /// Sets `learn.loss`.
    fn get_loss(&self, learn: &mut Learner) -> Result<()>;

    /// Sets `learn.grads`.
    fn backward(&self, learn: &mut Learner) -> Result<()>;

    fn step(&self, learn: &mut Learner) -> Result<()>;

    fn zero_grad(&self, learn: &mut Learner) -> Result<()>;
}

/// Plain forward, loss, backward and optimizer step.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicTrainStep;

impl TrainStep for BasicTrainStep {
    fn predict(&self, learn: &mut Learner) -> Result<()> {
        let inputs = learn.inputs()?;
        let preds = learn.model.forward(&inputs)?;
        // Evaluation never backpropagates, so cut the graph here.
        learn.preds = Some(if learn.training() {
            preds
        } else {
            preds.detach()
        });
        Ok(())
    }

    fn get_loss(&self, learn: &mut Learner) -> Result<()> {
        let preds = require(&learn.preds, "predictions")?;
        let loss = (learn.loss_fn)(preds, learn.yb()?)?;
        learn.loss = Some(loss);
        Ok(())
    }

    fn backward(&self, learn: &mut Learner) -> Result<()> {
        let grads = require(&learn.loss, "loss")?.backward()?;
        learn.grads = Some(grads);
        Ok(())
    }

    fn step(&self, learn: &mut Learner) -> Result<()> {
        let grads = require(&learn.grads, "gradients")?;
        let opt = learn
            .opt
            .as_deref_mut()
            .ok_or_else(|| Error::msg("no optimizer, step called outside of fit"))?;
        opt.step(grads)?;
        Ok(())
    }

    fn zero_grad(&self, learn: &mut Learner) -> Result<()> {
        learn.grads = None;
        Ok(())
    }
}

fn require<'a, T>(value: &'a Option<T>, what: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| Error::msg(format!("{what} not available at this point of the batch")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Fit,
    Epoch,
    Batch,
}

impl Stage {
    fn before(self) -> Event {
        match self {
            Self::Fit => Event::BeforeFit,
            Self::Epoch => Event::BeforeEpoch,
            Self::Batch => Event::BeforeBatch,
        }
    }

    fn after(self) -> Event {
        match self {
            Self::Fit => Event::AfterFit,
            Self::Epoch => Event::AfterEpoch,
            Self::Batch => Event::AfterBatch,
        }
    }

    fn cleanup(self) -> Event {
        match self {
            Self::Fit => Event::CleanupFit,
            Self::Epoch => Event::CleanupEpoch,
            Self::Batch => Event::CleanupBatch,
        }
    }

    fn cancel(self) -> Cancel {
        match self {
            Self::Fit => Cancel::Fit,
            Self::Epoch => Cancel::Epoch,
            Self::Batch => Cancel::Batch,
        }
    }
}

/// Swallows a cancellation of `kind`, passes everything else through.
fn catch(result: Result<()>, kind: Cancel) -> Result<()> {
    match result {
        Err(err) if err.is_cancelled(kind) => {
            debug!(%kind, "cancelled");
            Ok(())
        }
        other => other,
    }
}

/// State shared with every callback during a fit.
pub struct Learner {
    pub model: Box<dyn Model>,
    pub dls: DataLoaders,
    /// The loader of the current phase. Callbacks may replace it in `before_epoch`.
    pub dl: Rc<dyn DataLoader>,
    pub loss_fn: LossFn,
    pub lr: f64,
    pub opt_fn: OptFn,
    /// Rebuilt at the start of every fit.
    pub opt: Option<Box<dyn Optim>>,
    pub callbacks: Vec<CallbackRef>,
    train_step: Rc<dyn TrainStep>,
    /// Leading batch elements fed to the model; the element after them is the target.
    pub n_inp: usize,
    mode: Rc<Cell<bool>>,
    pub n_epochs: usize,
    pub epochs: Range<usize>,
    pub epoch: usize,
    pub iter: usize,
    pub batch: Option<Batch>,
    pub preds: Option<Tensor>,
    pub loss: Option<Tensor>,
    pub grads: Option<GradStore>,
    /// Written by the metrics callback after each epoch.
    pub epoch_log: Option<EpochLog>,
}

impl Learner {
    pub fn new(
        model: impl Model + 'static,
        dls: DataLoaders,
        loss_fn: LossFn,
        lr: f64,
        callbacks: Vec<CallbackRef>,
    ) -> Self {
        let dl = dls.train.clone();
        let mode = Rc::new(Cell::new(model.is_training()));
        Self {
            model: Box::new(model),
            dls,
            dl,
            loss_fn,
            lr,
            opt_fn: sgd(),
            opt: None,
            callbacks,
            train_step: Rc::new(BasicTrainStep),
            n_inp: 1,
            mode,
            n_epochs: 0,
            epochs: 0..0,
            epoch: 0,
            iter: 0,
            batch: None,
            preds: None,
            loss: None,
            grads: None,
            epoch_log: None,
        }
    }

    pub fn with_opt_fn(mut self, opt_fn: OptFn) -> Self {
        self.opt_fn = opt_fn;
        self
    }

    pub fn with_train_step(mut self, step: impl TrainStep + 'static) -> Self {
        self.train_step = Rc::new(step);
        self
    }

    pub fn with_n_inp(mut self, n_inp: usize) -> Self {
        self.n_inp = n_inp.max(1);
        self
    }

    pub fn with_callback(mut self, cb: CallbackRef) -> Self {
        self.callbacks.push(cb);
        self
    }

    pub fn train_step(&self) -> Rc<dyn TrainStep> {
        self.train_step.clone()
    }

    /// Installs a new strategy and returns the previous one.
    pub fn set_train_step(&mut self, step: Rc<dyn TrainStep>) -> Rc<dyn TrainStep> {
        std::mem::replace(&mut self.train_step, step)
    }

    /// Whether the model is in training mode, i.e. the training loader is being iterated.
    pub fn training(&self) -> bool {
        self.model.is_training()
    }

    /// Switches the model between training and evaluation mode.
    pub fn set_training(&mut self, training: bool) {
        self.model.train(training);
        self.mode.set(training);
    }

    /// A shared view of the model's training flag. It follows [`Learner::set_training`] and is
    /// resynchronized with the model before every event.
    pub fn mode_flag(&self) -> Rc<Cell<bool>> {
        self.mode.clone()
    }

    /// The model input of the current batch: element 0, or a tuple of the first `n_inp`
    /// elements.
    pub fn inputs(&self) -> Result<Batch> {
        let batch = require(&self.batch, "batch")?;
        if self.n_inp == 1 {
            return Ok(batch.get(0)?.clone());
        }
        let items = (0..self.n_inp)
            .map(|i| batch.get(i).cloned())
            .collect::<candle::Result<Vec<_>>>()?;
        Ok(Batch::Tuple(items))
    }

    /// First tensor leaf of the model input.
    pub fn xb(&self) -> Result<&Tensor> {
        let batch = require(&self.batch, "batch")?;
        batch
            .get(0)?
            .leaves()
            .into_iter()
            .next()
            .ok_or_else(|| Error::msg("batch input holds no tensor"))
    }

    /// Target of the current batch, the element right after the inputs.
    pub fn yb(&self) -> Result<&Tensor> {
        Ok(require(&self.batch, "batch")?.get(self.n_inp)?.as_tensor()?)
    }

    pub fn loss_value(&self) -> Result<f32> {
        let loss = require(&self.loss, "loss")?;
        Ok(loss.to_dtype(candle::DType::F32)?.to_scalar::<f32>()?)
    }

    pub fn opt_mut(&mut self) -> Result<&mut Box<dyn Optim>> {
        self.opt
            .as_mut()
            .ok_or_else(|| Error::msg("no optimizer, the learner has not been fitted"))
    }

    /// Fires `event` on the registered callbacks.
    pub fn callback(&mut self, event: Event) -> Result<()> {
        self.mode.set(self.model.is_training());
        let callbacks = self.callbacks.clone();
        run_callbacks(&callbacks, event, self)
    }

    /// Names of the registered callbacks in registration order, skipping any callback that is
    /// running right now.
    pub fn callback_names(&self) -> Vec<&'static str> {
        self.callbacks
            .iter()
            .filter_map(|cb| cb.try_borrow().ok().map(|cb| cb.name()))
            .collect()
    }

    /// Trains for `config.n_epochs` epochs. `config.callbacks` are registered for this call
    /// only and removed again on every exit path.
    pub fn fit(&mut self, config: FitConfig) -> Result<()> {
        config.validate()?;
        let FitConfig {
            n_epochs,
            train,
            valid,
            lr,
            callbacks,
        } = config;

        self.callbacks.extend(callbacks.iter().cloned());
        let result = self.run_fit(n_epochs, train, valid, lr);
        // One occurrence per extra, from the end, so a permanent registration survives.
        for extra in callbacks.iter() {
            if let Some(pos) = self.callbacks.iter().rposition(|cb| same_callback(cb, extra)) {
                self.callbacks.remove(pos);
            }
        }
        result
    }

    fn run_fit(&mut self, n_epochs: usize, train: bool, valid: bool, lr: Option<f64>) -> Result<()> {
        self.n_epochs = n_epochs;
        self.epochs = 0..n_epochs;
        let lr = lr.unwrap_or(self.lr);
        self.opt = Some((self.opt_fn)(self.model.parameters(), lr)?);
        debug!(n_epochs, train, valid, lr, "fit");

        self.with_events(Stage::Fit, |learn| {
            for epoch in learn.epochs.clone() {
                learn.epoch = epoch;
                if train {
                    learn.one_epoch(true)?;
                }
                if valid {
                    learn.one_epoch(false)?;
                }
            }
            Ok(())
        })
    }

    /// One pass over the training (`true`) or validation (`false`) loader.
    pub fn one_epoch(&mut self, training: bool) -> Result<()> {
        self.set_training(training);
        self.dl = if training {
            self.dls.train.clone()
        } else {
            self.dls.valid.clone()
        };

        self.with_events(Stage::Epoch, |learn| {
            let dl = learn.dl.clone();
            for (iter, batch) in dl.iter().enumerate() {
                learn.iter = iter;
                learn.batch = Some(batch?);
                learn.preds = None;
                learn.loss = None;
                learn.one_batch()?;
            }
            Ok(())
        })
    }

    /// Predict, loss and, in training mode, backward, step and zero-grad on `self.batch`.
    pub fn one_batch(&mut self) -> Result<()> {
        self.with_events(Stage::Batch, |learn| {
            let step = learn.train_step.clone();
            step.predict(learn)?;
            learn.callback(Event::AfterPredict)?;
            step.get_loss(learn)?;
            learn.callback(Event::AfterLoss)?;
            if learn.training() {
                step.backward(learn)?;
                learn.callback(Event::AfterBackward)?;
                step.step(learn)?;
                learn.callback(Event::AfterStep)?;
                step.zero_grad(learn)?;
            }
            Ok(())
        })
    }

    fn with_events<F>(&mut self, stage: Stage, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let kind = stage.cancel();
        let mut outcome = self.callback(stage.before());
        if outcome.is_ok() {
            outcome = body(self);
        }
        let outcome = catch(outcome, kind).and_then(|()| self.callback(stage.after()));
        let outcome = catch(outcome, kind);
        let cleanup = catch(self.callback(stage.cleanup()), kind);
        outcome.and(cleanup)
    }
}

fn same_callback(a: &CallbackRef, b: &CallbackRef) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{callback, Callback};
    use crate::testing::{tiny_learner, Recorder};
    use std::cell::RefCell;

    struct Raise {
        at: Event,
        err: fn() -> Error,
        after_iter: Option<usize>,
    }

    impl Callback for Raise {
        fn on_event(&mut self, event: Event, learn: &mut Learner) -> Result<()> {
            let iter_matches = self.after_iter.map_or(true, |i| learn.iter == i);
            if event == self.at && iter_matches {
                return Err((self.err)());
            }
            Ok(())
        }
    }

    #[test]
    fn optimizer_uses_override_lr() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        learn.fit(FitConfig::new(1).lr(0.25))?;
        assert_eq!(learn.opt_mut()?.learning_rate(), 0.25);
        learn.fit(FitConfig::new(1))?;
        assert_eq!(learn.opt_mut()?.learning_rate(), learn.lr);
        Ok(())
    }

    #[test]
    fn zero_epochs_rejected_before_dispatch() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let rec = Rc::new(RefCell::new(Recorder::default()));
        learn.callbacks.push(rec.clone());
        assert!(matches!(learn.fit(FitConfig::new(0)), Err(Error::InvalidConfig(_))));
        assert!(rec.borrow().events.is_empty());
        Ok(())
    }

    #[test]
    fn mode_matches_phase() -> anyhow::Result<()> {
        struct CheckMode(Vec<bool>);
        impl Callback for CheckMode {
            fn before_batch(&mut self, learn: &mut Learner) -> Result<()> {
                self.0.push(learn.training());
                Ok(())
            }
        }
        let mut learn = tiny_learner(2)?;
        let cm = Rc::new(RefCell::new(CheckMode(Vec::new())));
        learn.fit(FitConfig::new(1).callback(cm.clone()))?;
        assert_eq!(cm.borrow().0, vec![true, true, false, false]);
        Ok(())
    }

    #[test]
    fn cancel_batch_in_after_predict_skips_backward() -> anyhow::Result<()> {
        let mut learn = tiny_learner(2)?;
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let raise = callback(Raise {
            at: Event::AfterPredict,
            err: Error::cancel_batch,
            after_iter: Some(0),
        });
        learn.fit(FitConfig::new(1).valid(false).callbacks([raise, rec.clone() as CallbackRef]))?;

        let names = rec.borrow().names();
        assert_eq!(
            names,
            vec![
                "before_fit",
                "before_epoch",
                // first batch: cancelled after predict, after_batch still fires
                "before_batch",
                "after_batch",
                "cleanup_batch",
                "before_batch",
                "after_predict",
                "after_loss",
                "after_backward",
                "after_step",
                "after_batch",
                "cleanup_batch",
                "after_epoch",
                "cleanup_epoch",
                "after_fit",
                "cleanup_fit",
            ]
        );
        Ok(())
    }

    #[test]
    fn cancel_batch_in_before_batch_skips_the_whole_step() -> anyhow::Result<()> {
        struct SeenLoss(Vec<bool>);
        impl Callback for SeenLoss {
            fn after_batch(&mut self, learn: &mut Learner) -> Result<()> {
                self.0.push(learn.preds.is_some() || learn.loss.is_some());
                Ok(())
            }
        }

        let mut learn = tiny_learner(2)?;
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let seen = Rc::new(RefCell::new(SeenLoss(Vec::new())));
        let raise = callback(Raise {
            at: Event::BeforeBatch,
            err: Error::cancel_batch,
            after_iter: Some(0),
        });
        learn.fit(FitConfig::new(1).valid(false).callbacks([
            raise,
            rec.clone() as CallbackRef,
            seen.clone() as CallbackRef,
        ]))?;

        let names = rec.borrow().names();
        assert_eq!(
            names,
            vec![
                "before_fit",
                "before_epoch",
                // the recorder runs after the cancelling callback, so it never sees batch 0 start
                "after_batch",
                "cleanup_batch",
                "before_batch",
                "after_predict",
                "after_loss",
                "after_backward",
                "after_step",
                "after_batch",
                "cleanup_batch",
                "after_epoch",
                "cleanup_epoch",
                "after_fit",
                "cleanup_fit",
            ]
        );
        assert_eq!(seen.borrow().0, vec![false, true]);
        Ok(())
    }

    #[test]
    fn several_inputs_reach_the_model_as_a_tuple() -> anyhow::Result<()> {
        struct SumInputs(Box<dyn Model>);
        impl Model for SumInputs {
            fn forward(&self, xs: &Batch) -> candle::Result<Tensor> {
                let a = xs.get(0)?.as_tensor()?;
                let b = xs.get(1)?.as_tensor()?;
                self.0.forward(&Batch::Tensor(a.add(b)?))
            }
            fn parameters(&self) -> Vec<candle::Var> {
                self.0.parameters()
            }
            fn train(&mut self, training: bool) {
                self.0.train(training)
            }
            fn is_training(&self) -> bool {
                self.0.is_training()
            }
        }

        let template = tiny_learner(1)?;
        let Some(Ok(pair)) = template.dls.train.iter().next() else {
            anyhow::bail!("tiny learner has a batch");
        };
        let (xs, ys) = (pair.input()?.clone(), pair.target()?.clone());
        let batch = Batch::Tuple(vec![xs.clone().into(), xs.clone().into(), ys.clone().into()]);
        let batches = vec![batch.clone(), batch];
        let mut learn = Learner::new(
            SumInputs(template.model),
            DataLoaders::new(batches.clone(), batches),
            crate::loss::mse(),
            0.01,
            Vec::new(),
        )
        .with_n_inp(2);

        learn.fit(FitConfig::new(2))?;
        assert!(matches!(learn.inputs()?, Batch::Tuple(items) if items.len() == 2));
        assert_eq!(learn.yb()?.dims(), ys.dims());
        assert_eq!(learn.xb()?.dims(), xs.dims());
        Ok(())
    }

    #[test]
    fn cleanup_fires_on_fatal_error() -> anyhow::Result<()> {
        let mut learn = tiny_learner(2)?;
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let raise = callback(Raise {
            at: Event::AfterLoss,
            err: || Error::msg("numeric failure"),
            after_iter: None,
        });
        learn.callbacks.push(rec.clone());
        let err = learn.fit(FitConfig::new(3).callback(raise)).unwrap_err();
        assert!(err.to_string().contains("numeric failure"));

        let names = rec.borrow().names();
        assert_eq!(
            names,
            vec![
                "before_fit",
                "before_epoch",
                "before_batch",
                "after_predict",
                "after_loss",
                "cleanup_batch",
                "cleanup_epoch",
                "cleanup_fit",
            ]
        );
        Ok(())
    }

    #[test]
    fn broader_cancel_skips_inner_after_events() -> anyhow::Result<()> {
        let mut learn = tiny_learner(3)?;
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let raise = callback(Raise {
            at: Event::BeforeBatch,
            err: Error::cancel_fit,
            after_iter: Some(1),
        });
        learn.callbacks.push(rec.clone());
        learn.fit(FitConfig::new(2).callback(raise))?;

        let names = rec.borrow().names();
        let tail: Vec<_> = names.iter().rev().take(6).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                "cleanup_batch",
                "before_batch",
                "cleanup_batch",
                "cleanup_epoch",
                "after_fit",
                "cleanup_fit",
            ]
        );
        assert!(!names.contains(&"after_epoch"));
        Ok(())
    }

    #[test]
    fn swapping_the_train_step() -> anyhow::Result<()> {
        struct NoStep;
        impl TrainStep for NoStep {
            fn predict(&self, learn: &mut Learner) -> Result<()> {
                BasicTrainStep.predict(learn)
            }
            fn get_loss(&self, learn: &mut Learner) -> Result<()> {
                BasicTrainStep.get_loss(learn)
            }
            fn backward(&self, _learn: &mut Learner) -> Result<()> {
                Ok(())
            }
            fn step(&self, _learn: &mut Learner) -> Result<()> {
                Ok(())
            }
            fn zero_grad(&self, _learn: &mut Learner) -> Result<()> {
                Ok(())
            }
        }

        let mut learn = tiny_learner(2)?.with_train_step(NoStep);
        let before: Vec<Vec<f32>> = learn
            .model
            .parameters()
            .iter()
            .map(|v| v.flatten_all().and_then(|t| t.to_vec1::<f32>()))
            .collect::<candle::Result<_>>()?;
        learn.fit(FitConfig::new(2))?;
        let after: Vec<Vec<f32>> = learn
            .model
            .parameters()
            .iter()
            .map(|v| v.flatten_all().and_then(|t| t.to_vec1::<f32>()))
            .collect::<candle::Result<_>>()?;
        assert_eq!(before, after);

        let previous = learn.set_train_step(Rc::new(BasicTrainStep));
        learn.set_train_step(previous);
        Ok(())
    }
}

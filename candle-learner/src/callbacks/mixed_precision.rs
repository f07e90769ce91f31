//! Dynamic loss scaling.
//!
//! The loss is multiplied by a large factor before backpropagation so that small gradients
//! survive reduced-precision arithmetic, then gradients are divided by the same factor before
//! the optimizer step. Steps whose gradients overflow are skipped and the scale backs off; after
//! `growth_interval` clean steps it grows again.

use super::{Callback, DeviceCallback};
use crate::learner::{BasicTrainStep, TrainStep};
use crate::{Error, Learner, Result};
use candle::{DType, Tensor};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    /// Clamps out-of-range settings to usable values.
    fn sanitize(mut self) -> Self {
        if self.growth_factor < 1.0 {
            self.growth_factor = 1.0;
        }
        if !(0.0..1.0).contains(&self.backoff_factor) {
            self.backoff_factor = 0.5;
        }
        if self.growth_interval == 0 {
            self.growth_interval = 1;
        }
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        if self.max_scale < self.min_scale {
            self.max_scale = self.min_scale;
        }
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

/// A [`TrainStep`] that scales the loss and unscales gradients around `inner`.
pub struct MixedPrecisionStep {
    inner: Rc<dyn TrainStep>,
    config: LossScaleConfig,
    scale: Cell<f32>,
    stable_steps: Cell<usize>,
    skipped: Cell<usize>,
}

impl MixedPrecisionStep {
    pub fn new(config: LossScaleConfig, inner: Rc<dyn TrainStep>) -> Self {
        let config = config.sanitize();
        Self {
            inner,
            scale: Cell::new(config.initial_scale),
            config,
            stable_steps: Cell::new(0),
            skipped: Cell::new(0),
        }
    }

    pub fn loss_scale(&self) -> f32 {
        self.scale.get()
    }

    /// Optimizer steps dropped because of non-finite gradients.
    pub fn skipped_steps(&self) -> usize {
        self.skipped.get()
    }

    fn update(&self, found_inf: bool) {
        let cfg = &self.config;
        if found_inf {
            self.scale
                .set((self.scale.get() * cfg.backoff_factor).max(cfg.min_scale));
            self.stable_steps.set(0);
            return;
        }
        let stable = self.stable_steps.get() + 1;
        if stable >= cfg.growth_interval {
            self.scale
                .set((self.scale.get() * cfg.growth_factor).min(cfg.max_scale));
            self.stable_steps.set(0);
        } else {
            self.stable_steps.set(stable);
        }
    }
}

impl Default for MixedPrecisionStep {
    fn default() -> Self {
        Self::new(LossScaleConfig::default(), Rc::new(BasicTrainStep))
    }
}

fn contains_non_finite(tensor: &Tensor) -> candle::Result<bool> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let tensor = tensor.to_dtype(DType::F32)?;
    // NaN is the only value unequal to itself; `max` would not propagate it.
    let has_nan = tensor.ne(&tensor)?.max_all()?.to_vec0::<u8>()? > 0;
    let peak = tensor.abs()?.max_all()?.to_vec0::<f32>()?;
    Ok(has_nan || peak.is_infinite())
}

impl TrainStep for MixedPrecisionStep {
    fn predict(&self, learn: &mut Learner) -> Result<()> {
        self.inner.predict(learn)
    }

    fn get_loss(&self, learn: &mut Learner) -> Result<()> {
        self.inner.get_loss(learn)?;
        // Reductions in half precision lose too much; keep the loss in f32.
        if let Some(loss) = learn.loss.take() {
            learn.loss = Some(loss.to_dtype(DType::F32)?);
        }
        Ok(())
    }

    fn backward(&self, learn: &mut Learner) -> Result<()> {
        let loss = learn
            .loss
            .as_ref()
            .ok_or_else(|| Error::msg("loss not available at this point of the batch"))?;
        let scaled = loss.affine(self.scale.get() as f64, 0.0)?;
        learn.grads = Some(scaled.backward()?);
        Ok(())
    }

    fn step(&self, learn: &mut Learner) -> Result<()> {
        let inv_scale = 1.0 / self.scale.get() as f64;
        let params = learn.model.parameters();
        let grads = learn
            .grads
            .as_mut()
            .ok_or_else(|| Error::msg("gradients not available at this point of the batch"))?;

        let mut found_inf = false;
        for var in params.iter() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            let grad = grad.affine(inv_scale, 0.0)?;
            found_inf |= contains_non_finite(&grad)?;
            grads.insert(var, grad);
        }

        if found_inf {
            self.skipped.set(self.skipped.get() + 1);
            warn!(
                scale = self.scale.get(),
                iter = learn.iter,
                "non-finite gradients, skipping optimizer step"
            );
        } else {
            self.inner.step(learn)?;
        }
        self.update(found_inf);
        Ok(())
    }

    fn zero_grad(&self, learn: &mut Learner) -> Result<()> {
        self.inner.zero_grad(learn)
    }
}

/// Installs a [`MixedPrecisionStep`] for the duration of a fit.
///
/// The previous step strategy is wrapped and restored when the fit ends, whichever way it ends.
pub struct MixedPrecisionCallback {
    config: LossScaleConfig,
    step: Option<Rc<MixedPrecisionStep>>,
    previous: Option<Rc<dyn TrainStep>>,
}

impl MixedPrecisionCallback {
    pub const ORDER: i32 = DeviceCallback::ORDER + 1;

    pub fn new(config: LossScaleConfig) -> Self {
        Self {
            config,
            step: None,
            previous: None,
        }
    }

    /// The step installed by the current or last fit.
    pub fn step(&self) -> Option<&MixedPrecisionStep> {
        self.step.as_deref()
    }

    fn restore(&mut self, learn: &mut Learner) {
        if let Some(previous) = self.previous.take() {
            learn.set_train_step(previous);
            if let Some(step) = &self.step {
                debug!(
                    scale = step.loss_scale(),
                    skipped = step.skipped_steps(),
                    "restored train step"
                );
            }
        }
    }
}

impl Default for MixedPrecisionCallback {
    fn default() -> Self {
        Self::new(LossScaleConfig::default())
    }
}

impl Callback for MixedPrecisionCallback {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "MixedPrecisionCallback"
    }

    fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
        let inner = learn.train_step();
        let step = Rc::new(MixedPrecisionStep::new(self.config.clone(), inner));
        self.previous = Some(learn.set_train_step(step.clone()));
        self.step = Some(step);
        Ok(())
    }

    fn after_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.restore(learn);
        Ok(())
    }

    fn cleanup_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.restore(learn);
        Ok(())
    }
}

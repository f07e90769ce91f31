//! Learning-rate schedules and a value recorder.

use super::Callback;
use crate::{Learner, Result};
use std::f64::consts::PI;

/// A learning-rate schedule. Each `step` advances it once and returns the new rate.
pub trait LrScheduler {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Multiplies the rate by `gamma` every `step_size` steps.
#[derive(Clone, Debug)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    steps: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            steps: 0,
        }
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self) -> f64 {
        self.steps += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr * self.gamma.powi((self.steps / self.step_size) as i32)
    }
}

/// Multiplies the rate by `gamma` every step.
#[derive(Clone, Debug)]
pub struct ExponentialLr {
    lr: f64,
    gamma: f64,
}

impl ExponentialLr {
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self { lr: base_lr, gamma }
    }
}

impl LrScheduler for ExponentialLr {
    fn step(&mut self) -> f64 {
        self.lr *= self.gamma;
        self.lr
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

/// Half a cosine wave from `base_lr` down to `eta_min` over `t_max` steps, then flat.
#[derive(Clone, Debug)]
pub struct CosineAnnealingLr {
    base_lr: f64,
    eta_min: f64,
    t_max: usize,
    steps: usize,
}

impl CosineAnnealingLr {
    pub fn new(base_lr: f64, t_max: usize, eta_min: f64) -> Self {
        Self {
            base_lr,
            eta_min,
            t_max: t_max.max(1),
            steps: 0,
        }
    }
}

impl LrScheduler for CosineAnnealingLr {
    fn step(&mut self) -> f64 {
        self.steps += 1;
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        let progress = self.steps.min(self.t_max) as f64 / self.t_max as f64;
        self.eta_min + (self.base_lr - self.eta_min) * (1.0 + (PI * progress).cos()) / 2.0
    }
}

/// Builds a schedule from the optimizer's learning rate at the start of a fit.
pub type SchedulerFn = Box<dyn Fn(f64) -> Box<dyn LrScheduler>>;

struct Schedule {
    make: SchedulerFn,
    current: Option<Box<dyn LrScheduler>>,
}

impl Schedule {
    fn new(make: SchedulerFn) -> Self {
        Self {
            make,
            current: None,
        }
    }

    fn start(&mut self, learn: &mut Learner) -> Result<()> {
        let base_lr = learn.opt_mut()?.learning_rate();
        self.current = Some((self.make)(base_lr));
        Ok(())
    }

    fn step(&mut self, learn: &mut Learner) -> Result<()> {
        if !learn.training() {
            return Ok(());
        }
        if let Some(sched) = self.current.as_mut() {
            let lr = sched.step();
            learn.opt_mut()?.set_learning_rate(lr);
        }
        Ok(())
    }
}

/// Steps a schedule after every training batch.
pub struct BatchSchedCallback(Schedule);

impl BatchSchedCallback {
    pub fn new<F, S>(make: F) -> Self
    where
        F: Fn(f64) -> S + 'static,
        S: LrScheduler + 'static,
    {
        Self(Schedule::new(Box::new(move |lr| Box::new(make(lr)))))
    }
}

impl Callback for BatchSchedCallback {
    fn name(&self) -> &'static str {
        "BatchSchedCallback"
    }

    fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.0.start(learn)
    }

    fn after_batch(&mut self, learn: &mut Learner) -> Result<()> {
        self.0.step(learn)
    }
}

/// Steps a schedule after every training epoch.
pub struct EpochSchedCallback(Schedule);

impl EpochSchedCallback {
    pub fn new<F, S>(make: F) -> Self
    where
        F: Fn(f64) -> S + 'static,
        S: LrScheduler + 'static,
    {
        Self(Schedule::new(Box::new(move |lr| Box::new(make(lr)))))
    }
}

impl Callback for EpochSchedCallback {
    fn name(&self) -> &'static str {
        "EpochSchedCallback"
    }

    fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.0.start(learn)
    }

    fn after_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        self.0.step(learn)
    }
}

type Probe = Box<dyn Fn(&Learner) -> f64>;

/// Records named values after every training batch, e.g. the learning rate.
pub struct RecorderCallback {
    probes: Vec<(String, Probe, Vec<f64>)>,
}

impl RecorderCallback {
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    pub fn record(mut self, name: impl Into<String>, probe: impl Fn(&Learner) -> f64 + 'static) -> Self {
        self.probes.push((name.into(), Box::new(probe), Vec::new()));
        self
    }

    /// Shorthand for recording the optimizer's learning rate as `"lr"`.
    pub fn lr(self) -> Self {
        self.record("lr", |learn| {
            learn.opt.as_ref().map_or(learn.lr, |opt| opt.learning_rate())
        })
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.probes
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, values)| values.as_slice())
    }
}

impl Default for RecorderCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for RecorderCallback {
    fn name(&self) -> &'static str {
        "RecorderCallback"
    }

    fn before_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        for (_, _, values) in self.probes.iter_mut() {
            values.clear();
        }
        Ok(())
    }

    fn after_batch(&mut self, learn: &mut Learner) -> Result<()> {
        if !learn.training() {
            return Ok(());
        }
        for (_, probe, values) in self.probes.iter_mut() {
            values.push(probe(learn));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_learner;
    use crate::{CallbackRef, FitConfig};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn step_lr_decays_in_stairs() {
        let mut s = StepLr::new(1.0, 2, 0.5);
        let lrs: Vec<f64> = (0..5).map(|_| s.step()).collect();
        assert_eq!(lrs, vec![1.0, 0.5, 0.5, 0.25, 0.25]);
    }

    #[test]
    fn cosine_reaches_eta_min_and_stays() {
        let mut s = CosineAnnealingLr::new(1.0, 4, 0.1);
        let lrs: Vec<f64> = (0..6).map(|_| s.step()).collect();
        assert!(close(lrs[1], 0.55));
        assert!(close(lrs[3], 0.1));
        assert!(close(lrs[5], 0.1));
        assert!(lrs.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn batch_schedule_steps_only_while_training() -> anyhow::Result<()> {
        let mut learn = tiny_learner(3)?;
        let sched = Rc::new(RefCell::new(BatchSchedCallback::new(|lr| ExponentialLr::new(lr, 0.5))));
        let rec = Rc::new(RefCell::new(RecorderCallback::new().lr()));
        // The recorder runs after the scheduler, so it sees each updated rate.
        learn.fit(FitConfig::new(1).lr(0.8).callbacks([sched as CallbackRef, rec.clone() as CallbackRef]))?;

        let lrs = rec.borrow().get("lr").map(<[f64]>::to_vec).unwrap_or_default();
        assert_eq!(lrs, vec![0.4, 0.2, 0.1]);
        assert!(close(learn.opt_mut()?.learning_rate(), 0.1));
        Ok(())
    }

    #[test]
    fn epoch_schedule_steps_once_per_training_pass() -> anyhow::Result<()> {
        let mut learn = tiny_learner(2)?;
        let sched = Rc::new(RefCell::new(EpochSchedCallback::new(|lr| StepLr::new(lr, 1, 0.1))));
        learn.fit(FitConfig::new(3).lr(1.0).callback(sched))?;
        assert!(close(learn.opt_mut()?.learning_rate(), 1e-3));
        Ok(())
    }
}

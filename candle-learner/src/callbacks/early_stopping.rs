//! Early stopping callback.

use super::{Callback, EpochLog, MetricsCallback, Mode};
use crate::{Error, Learner, Result};
use tracing::{info, warn};

/// Cancels the fit once a monitored value stops improving for `patience` epochs.
///
/// Reads the [`EpochLog`] that [`MetricsCallback`] leaves on the learner, by default the
/// validation pass's loss.
pub struct EarlyStopping {
    monitor: String,
    patience: usize,
    min_delta: f64,
    mode: Mode,
    on_train: bool,
    best: Option<f64>,
    epochs_without_improvement: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub const ORDER: i32 = MetricsCallback::ORDER + 1;

    pub fn new() -> Self {
        Self {
            monitor: "loss".to_string(),
            patience: 3,
            min_delta: 0.0,
            mode: Mode::Min,
            on_train: false,
            best: None,
            epochs_without_improvement: 0,
            stopped_epoch: None,
        }
    }

    /// `"loss"` or the name of a metric registered on [`MetricsCallback`].
    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f64) -> Self {
        self.min_delta = delta;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Watch the training pass instead of the validation pass.
    pub fn on_train(mut self, on_train: bool) -> Self {
        self.on_train = on_train;
        self
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// The epoch during which the fit was cancelled, if it was.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    fn is_improvement(&self, current: f64, best: f64) -> bool {
        match self.mode {
            Mode::Min => current < best - self.min_delta,
            Mode::Max => current > best + self.min_delta,
        }
    }

    fn current<'a>(&self, learn: &'a Learner) -> Option<&'a EpochLog> {
        learn
            .epoch_log
            .as_ref()
            .filter(|log| log.epoch == learn.epoch && log.train == learn.training())
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for EarlyStopping {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "EarlyStopping"
    }

    fn before_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        self.best = None;
        self.epochs_without_improvement = 0;
        self.stopped_epoch = None;
        Ok(())
    }

    fn after_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        if learn.training() != self.on_train {
            return Ok(());
        }
        let Some(log) = self.current(learn) else {
            warn!("early stopping has no epoch log, is a MetricsCallback registered?");
            return Ok(());
        };
        let Some(current) = log.get(&self.monitor) else {
            warn!(monitor = %self.monitor, "monitored value missing from epoch log");
            return Ok(());
        };

        match self.best {
            Some(best) if !self.is_improvement(current, best) => {
                self.epochs_without_improvement += 1;
                if self.epochs_without_improvement >= self.patience {
                    info!(
                        epoch = learn.epoch,
                        monitor = %self.monitor,
                        best,
                        "no improvement, stopping"
                    );
                    self.stopped_epoch = Some(learn.epoch);
                    return Err(Error::cancel_fit());
                }
            }
            _ => {
                self.best = Some(current);
                self.epochs_without_improvement = 0;
            }
        }
        Ok(())
    }
}

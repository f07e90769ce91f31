//! Per-fit configuration.

use crate::callbacks::CallbackRef;
use crate::{Error, Result};

pub struct FitConfig {
    pub n_epochs: usize,
    /// Run the training phase of each epoch.
    pub train: bool,
    /// Run the validation phase of each epoch.
    pub valid: bool,
    /// Overrides the learner's learning rate for this fit only.
    pub lr: Option<f64>,
    /// Registered for the duration of this fit only.
    pub callbacks: Vec<CallbackRef>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            n_epochs: 1,
            train: true,
            valid: true,
            lr: None,
            callbacks: Vec::new(),
        }
    }
}

impl FitConfig {
    pub fn new(n_epochs: usize) -> Self {
        Self {
            n_epochs,
            ..Self::default()
        }
    }

    pub fn train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    pub fn lr(mut self, lr: f64) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn callback(mut self, cb: CallbackRef) -> Self {
        self.callbacks.push(cb);
        self
    }

    pub fn callbacks(mut self, cbs: impl IntoIterator<Item = CallbackRef>) -> Self {
        self.callbacks.extend(cbs);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_epochs == 0 {
            return Err(Error::InvalidConfig("n_epochs must be positive".into()));
        }
        if let Some(lr) = self.lr {
            if !lr.is_finite() || lr <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "learning rate must be positive and finite, got {lr}"
                )));
            }
        }
        Ok(())
    }
}

//! Per-epoch loss and metric aggregation.

use super::Callback;
use crate::metrics::{Mean, Metric};
use crate::{Learner, Result};
use std::fmt;
use tracing::info;

/// Aggregated values for one training or validation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochLog {
    pub epoch: usize,
    pub train: bool,
    pub loss: f64,
    pub metrics: Vec<(String, f64)>,
}

impl EpochLog {
    /// Looks up `"loss"` or a metric by name.
    pub fn get(&self, name: &str) -> Option<f64> {
        if name == "loss" {
            return Some(self.loss);
        }
        self.metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn header(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.metrics.iter().map(|(n, _)| n.clone()).collect();
        cols.extend(["loss", "epoch", "train"].map(String::from));
        cols
    }

    pub fn row(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.metrics.iter().map(|(_, v)| format!("{v:.3}")).collect();
        cols.push(format!("{:.3}", self.loss));
        cols.push(self.epoch.to_string());
        cols.push(self.phase().to_string());
        cols
    }

    pub fn phase(&self) -> &'static str {
        if self.train {
            "train"
        } else {
            "eval"
        }
    }
}

impl fmt::Display for EpochLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch={} {}", self.epoch, self.phase())?;
        for (name, value) in self.metrics.iter() {
            write!(f, " {name}={value:.3}")?;
        }
        write!(f, " loss={:.3}", self.loss)
    }
}

/// Tracks a batch-size weighted mean of the loss plus any user metrics, reset every epoch.
///
/// The finished [`EpochLog`] is stored in `learn.epoch_log` so callbacks ordered after this one
/// see final values.
pub struct MetricsCallback {
    metrics: Vec<(String, Box<dyn Metric>)>,
    loss: Mean,
    history: Vec<EpochLog>,
}

impl MetricsCallback {
    pub const ORDER: i32 = 0;

    pub fn new() -> Self {
        Self {
            metrics: Vec::new(),
            loss: Mean::new(),
            history: Vec::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, metric: impl Metric + 'static) -> Self {
        self.metrics.push((name.into(), Box::new(metric)));
        self
    }

    pub fn history(&self) -> &[EpochLog] {
        &self.history
    }
}

impl Default for MetricsCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for MetricsCallback {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "MetricsCallback"
    }

    fn before_epoch(&mut self, _learn: &mut Learner) -> Result<()> {
        self.loss.reset();
        for (_, m) in self.metrics.iter_mut() {
            m.reset();
        }
        Ok(())
    }

    fn after_batch(&mut self, learn: &mut Learner) -> Result<()> {
        // A batch cancelled before its loss was computed contributes nothing.
        let (Some(preds), Some(_)) = (&learn.preds, &learn.loss) else {
            return Ok(());
        };
        let targets = learn.yb()?;
        for (_, m) in self.metrics.iter_mut() {
            m.update(preds, targets)?;
        }
        let n = learn.xb()?.dim(0)?;
        self.loss.update(learn.loss_value()? as f64, n as f64);
        Ok(())
    }

    fn after_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        let log = EpochLog {
            epoch: learn.epoch,
            train: learn.training(),
            loss: self.loss.compute(),
            metrics: self
                .metrics
                .iter()
                .map(|(n, m)| (n.clone(), m.compute()))
                .collect(),
        };
        info!("{log}");
        self.history.push(log.clone());
        learn.epoch_log = Some(log);
        Ok(())
    }
}

//! Small general-purpose callbacks.

use super::Callback;
use crate::metrics::mean_std;
use crate::{Batch, Error, Learner, Result};
use tracing::info;

/// Stops the fit after the first batch. Handy for smoke-testing a setup.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleBatchCallback;

impl Callback for SingleBatchCallback {
    fn order(&self) -> i32 {
        1
    }

    fn name(&self) -> &'static str {
        "SingleBatchCallback"
    }

    fn after_batch(&mut self, _learn: &mut Learner) -> Result<()> {
        Err(Error::cancel_fit())
    }
}

/// Input statistics of one pass, recorded by [`BatchTransformCallback`].
#[derive(Clone, Debug, Default)]
pub struct InputStats {
    pub epoch: usize,
    pub train: bool,
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
}

type Transform = Box<dyn FnMut(&Batch) -> candle::Result<Batch>>;

/// Rewrites every batch before it reaches the model, e.g. to normalize inputs.
pub struct BatchTransformCallback {
    transform: Transform,
    on_train: bool,
    on_valid: bool,
    record_stats: bool,
    stats: Vec<InputStats>,
}

impl BatchTransformCallback {
    pub fn new<F>(transform: F) -> Self
    where
        F: FnMut(&Batch) -> candle::Result<Batch> + 'static,
    {
        Self {
            transform: Box::new(transform),
            on_train: true,
            on_valid: true,
            record_stats: false,
            stats: Vec::new(),
        }
    }

    pub fn on_train(mut self, on_train: bool) -> Self {
        self.on_train = on_train;
        self
    }

    pub fn on_valid(mut self, on_valid: bool) -> Self {
        self.on_valid = on_valid;
        self
    }

    /// Record mean and std of every transformed input and log a summary per pass.
    pub fn record_stats(mut self, record: bool) -> Self {
        self.record_stats = record;
        self
    }

    pub fn stats(&self) -> &[InputStats] {
        &self.stats
    }

    fn active(&self, training: bool) -> bool {
        (self.on_train && training) || (self.on_valid && !training)
    }
}

impl Callback for BatchTransformCallback {
    fn name(&self) -> &'static str {
        "BatchTransformCallback"
    }

    fn before_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        if self.record_stats {
            self.stats.push(InputStats {
                epoch: learn.epoch,
                train: learn.training(),
                ..Default::default()
            });
        }
        Ok(())
    }

    fn before_batch(&mut self, learn: &mut Learner) -> Result<()> {
        if !self.active(learn.training()) {
            return Ok(());
        }
        let Some(batch) = learn.batch.as_ref() else {
            return Ok(());
        };
        learn.batch = Some((self.transform)(batch)?);

        if self.record_stats {
            let (mean, std) = mean_std(learn.xb()?)?;
            if let Some(stats) = self.stats.last_mut() {
                stats.means.push(mean);
                stats.stds.push(std);
            }
        }
        Ok(())
    }

    fn after_epoch(&mut self, _learn: &mut Learner) -> Result<()> {
        let Some(stats) = self.stats.last().filter(|_| self.record_stats) else {
            return Ok(());
        };
        if stats.means.is_empty() {
            return Ok(());
        }
        let (m_mean, m_min, m_max) = summarize(&stats.means);
        let (s_mean, s_min, s_max) = summarize(&stats.stds);
        info!(
            epoch = stats.epoch,
            train = stats.train,
            "input stats: means (mean={m_mean:.2}, min={m_min:.2}, max={m_max:.2}), \
             stds (mean={s_mean:.2}, min={s_min:.2}, max={s_max:.2})"
        );
        Ok(())
    }
}

fn summarize(values: &[f32]) -> (f32, f32, f32) {
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    (mean, min, max)
}

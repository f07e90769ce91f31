//! Terminal progress reporting.

use super::{Callback, MetricsCallback};
use crate::{Error, Learner, Result};
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{prefix} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}";

/// Shows a progress bar per pass and prints each [`super::EpochLog`] as a table row.
///
/// Runs after [`MetricsCallback`] so the log it prints is the one of the finished pass.
pub struct ProgressCallback {
    plot: bool,
    hidden: bool,
    bar: Option<ProgressBar>,
    header_printed: bool,
    losses: Vec<f32>,
    val_losses: Vec<f32>,
}

impl ProgressCallback {
    pub const ORDER: i32 = MetricsCallback::ORDER + 1;

    pub fn new() -> Self {
        Self {
            plot: false,
            hidden: false,
            bar: None,
            header_printed: false,
            losses: Vec::new(),
            val_losses: Vec::new(),
        }
    }

    /// Keep every training batch loss and each validation pass loss for plotting.
    pub fn plot(mut self, plot: bool) -> Self {
        self.plot = plot;
        self
    }

    /// Draw nothing, e.g. when stdout is not a terminal.
    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    pub fn val_losses(&self) -> &[f32] {
        &self.val_losses
    }

    fn println(&self, line: String) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None if !self.hidden => println!("{line}"),
            None => {}
        }
    }
}

impl Default for ProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for ProgressCallback {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "ProgressCallback"
    }

    fn before_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        self.header_printed = false;
        self.losses.clear();
        self.val_losses.clear();
        Ok(())
    }

    fn before_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        let bar = if self.hidden {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(learn.dl.len() as u64)
        };
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)
            .map_err(|e| Error::msg(format!("progress template: {e}")))?
            .progress_chars("=>-");
        bar.set_style(style);
        let phase = if learn.training() { "train" } else { "eval" };
        bar.set_prefix(format!("{}/{} {phase}", learn.epoch + 1, learn.n_epochs));
        self.bar = Some(bar);
        Ok(())
    }

    fn after_batch(&mut self, learn: &mut Learner) -> Result<()> {
        let Some(bar) = &self.bar else {
            return Ok(());
        };
        bar.inc(1);
        if learn.loss.is_none() {
            return Ok(());
        }
        let loss = learn.loss_value()?;
        bar.set_message(format!("loss {loss:.3}"));
        if self.plot && learn.training() {
            self.losses.push(loss);
        }
        Ok(())
    }

    fn after_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        if let Some(log) = learn.epoch_log.clone() {
            if !self.header_printed {
                self.println(log.header().join("\t"));
                self.header_printed = true;
            }
            self.println(log.row().join("\t"));
            if self.plot && !learn.training() {
                self.val_losses.push(log.loss as f32);
            }
        }
        Ok(())
    }

    fn cleanup_epoch(&mut self, _learn: &mut Learner) -> Result<()> {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        Ok(())
    }
}

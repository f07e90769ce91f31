//! Callbacks that attach forward hooks for the duration of a fit.

use super::Callback;
use crate::hooks::{Activation, HookPoint, Hooks};
use crate::{Learner, Result};
use candle::{DType, Tensor};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

type HookFn = Rc<RefCell<dyn FnMut(usize, &Activation<'_>) -> candle::Result<()>>>;

enum Selection {
    All,
    Named(Vec<String>),
    Filter(Box<dyn Fn(&HookPoint) -> bool>),
}

/// Hooks `f` into the model's modules in `before_fit` and detaches them when the fit ends,
/// however it ends. `f` receives the position of the module among the selected ones.
///
/// The `on_train`/`on_valid` gate reads [`Learner::mode_flag`] at each forward pass.
pub struct HooksCallback {
    f: HookFn,
    selection: Selection,
    on_train: bool,
    on_valid: bool,
    hooks: Option<Hooks>,
}

impl HooksCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(usize, &Activation<'_>) -> candle::Result<()> + 'static,
    {
        Self {
            f: Rc::new(RefCell::new(f)),
            selection: Selection::All,
            on_train: true,
            on_valid: false,
            hooks: None,
        }
    }

    /// Hook only the modules with these names.
    pub fn modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = Selection::Named(names.into_iter().map(Into::into).collect());
        self
    }

    /// Hook only the modules `pred` accepts.
    pub fn filter(mut self, pred: impl Fn(&HookPoint) -> bool + 'static) -> Self {
        self.selection = Selection::Filter(Box::new(pred));
        self
    }

    pub fn on_train(mut self, on_train: bool) -> Self {
        self.on_train = on_train;
        self
    }

    pub fn on_valid(mut self, on_valid: bool) -> Self {
        self.on_valid = on_valid;
        self
    }

    /// Number of currently attached hooks.
    pub fn num_attached(&self) -> usize {
        self.hooks
            .as_ref()
            .map_or(0, |h| h.iter().filter(|h| h.is_attached()).count())
    }

    fn select(&self, learn: &Learner) -> Vec<HookPoint> {
        let modules = learn.model.modules();
        match &self.selection {
            Selection::All => modules,
            Selection::Named(names) => modules
                .into_iter()
                .filter(|p| names.iter().any(|n| n == p.name()))
                .collect(),
            Selection::Filter(pred) => modules.into_iter().filter(|p| pred(p)).collect(),
        }
    }

    fn release(&mut self) {
        if let Some(mut hooks) = self.hooks.take() {
            hooks.release();
        }
    }
}

impl Callback for HooksCallback {
    fn name(&self) -> &'static str {
        "HooksCallback"
    }

    fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.release();
        let points = self.select(learn);
        debug!(modules = points.len(), "attaching forward hooks");

        let (f, training) = (self.f.clone(), learn.mode_flag());
        let (on_train, on_valid) = (self.on_train, self.on_valid);
        self.hooks = Some(Hooks::new(&points, move |idx, act| {
            let training = training.get();
            if (training && on_train) || (!training && on_valid) {
                (&mut *f.borrow_mut())(idx, act)?;
            }
            Ok(())
        }));
        Ok(())
    }

    fn after_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        self.release();
        Ok(())
    }

    fn cleanup_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        self.release();
        Ok(())
    }
}

pub const HIST_BINS: usize = 40;
const HIST_MAX: f32 = 10.0;

/// Activation statistics of one module, one entry per forward pass.
#[derive(Clone, Debug, Default)]
pub struct LayerStats {
    pub module: String,
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
    /// Counts of `|x|` in [`HIST_BINS`] equal bins over `[0, 10]`.
    pub hists: Vec<Vec<f32>>,
}

impl LayerStats {
    fn record(&mut self, output: &Tensor) -> candle::Result<()> {
        let values = output.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        if values.is_empty() {
            return Ok(());
        }
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n - 1.0).max(1.0);
        self.means.push(mean);
        self.stds.push(var.sqrt());
        self.hists.push(histogram(&values));
        Ok(())
    }

    /// `log1p` of the histograms, one row per bin and one column per forward pass.
    pub fn color_dim(&self) -> Vec<Vec<f32>> {
        (0..HIST_BINS)
            .map(|bin| self.hists.iter().map(|h| h[bin].ln_1p()).collect())
            .collect()
    }

    /// Per forward pass, the share of activations that landed in the lowest bin.
    pub fn dead_chart(&self) -> Vec<f32> {
        self.hists
            .iter()
            .map(|h| {
                let total: f32 = h.iter().sum();
                if total == 0.0 {
                    0.0
                } else {
                    h[0] / total
                }
            })
            .collect()
    }
}

fn histogram(values: &[f32]) -> Vec<f32> {
    let mut hist = vec![0f32; HIST_BINS];
    let width = HIST_MAX / HIST_BINS as f32;
    for v in values.iter().map(|v| v.abs()) {
        if !(0.0..=HIST_MAX).contains(&v) {
            continue;
        }
        let bin = ((v / width) as usize).min(HIST_BINS - 1);
        hist[bin] += 1.0;
    }
    hist
}

/// Records mean, std and a histogram of every hooked module's output after each forward pass.
pub struct ActivationStats {
    inner: HooksCallback,
    stats: Rc<RefCell<Vec<LayerStats>>>,
}

impl ActivationStats {
    pub fn new() -> Self {
        let stats: Rc<RefCell<Vec<LayerStats>>> = Rc::default();
        let s = stats.clone();
        let inner = HooksCallback::new(move |idx, act| {
            let mut stats = s.borrow_mut();
            if stats.len() <= idx {
                stats.resize_with(idx + 1, LayerStats::default);
            }
            let layer = &mut stats[idx];
            if layer.module.is_empty() {
                layer.module = act.module.to_string();
            }
            layer.record(act.output)
        });
        Self { inner, stats }
    }

    pub fn modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner = self.inner.modules(names);
        self
    }

    pub fn filter(mut self, pred: impl Fn(&HookPoint) -> bool + 'static) -> Self {
        self.inner = self.inner.filter(pred);
        self
    }

    pub fn on_valid(mut self, on_valid: bool) -> Self {
        self.inner = self.inner.on_valid(on_valid);
        self
    }

    /// Stats per hooked module, in hook order.
    pub fn stats(&self) -> Vec<LayerStats> {
        self.stats.borrow().clone()
    }

    pub fn color_dim(&self, idx: usize) -> Option<Vec<Vec<f32>>> {
        self.stats.borrow().get(idx).map(LayerStats::color_dim)
    }

    pub fn dead_chart(&self, idx: usize) -> Option<Vec<f32>> {
        self.stats.borrow().get(idx).map(LayerStats::dead_chart)
    }
}

impl Default for ActivationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for ActivationStats {
    fn name(&self) -> &'static str {
        "ActivationStats"
    }

    fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.stats.borrow_mut().clear();
        self.inner.before_fit(learn)
    }

    fn after_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.inner.after_fit(learn)
    }

    fn cleanup_fit(&mut self, learn: &mut Learner) -> Result<()> {
        self.inner.cleanup_fit(learn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::callback;
    use crate::testing::tiny_learner;
    use crate::{CallbackRef, Error, FitConfig};
    use std::cell::Cell;

    struct Fail;

    impl Callback for Fail {
        fn after_loss(&mut self, _learn: &mut Learner) -> Result<()> {
            Err(Error::msg("boom"))
        }
    }

    fn attached(learn: &Learner) -> usize {
        learn.model.modules().iter().map(HookPoint::num_hooks).sum()
    }

    #[test]
    fn fires_only_in_enabled_modes() -> anyhow::Result<()> {
        let mut learn = tiny_learner(2)?;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let hooks = Rc::new(RefCell::new(HooksCallback::new(move |idx, act| {
            s.borrow_mut().push((idx, act.module.to_string()));
            Ok(())
        })));
        learn.fit(FitConfig::new(2).callback(hooks.clone()))?;

        // two training batches per epoch, validation is off by default
        assert_eq!(seen.borrow().len(), 4);
        assert!(seen.borrow().iter().all(|(i, m)| *i == 0 && m == "fc"));
        assert_eq!(attached(&learn), 0);
        assert_eq!(hooks.borrow().num_attached(), 0);
        Ok(())
    }

    /// Runs one forward pass per mode in `after_fit`, before the hooks are released.
    struct ForwardAfterFit;

    impl Callback for ForwardAfterFit {
        fn after_fit(&mut self, learn: &mut Learner) -> Result<()> {
            let inputs = learn.inputs()?;
            learn.set_training(false);
            learn.model.forward(&inputs)?;
            learn.set_training(true);
            learn.model.forward(&inputs)?;
            Ok(())
        }
    }

    #[test]
    fn gate_follows_mode_changes_outside_epochs() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let hooks = HooksCallback::new(move |_, _| {
            c.set(c.get() + 1);
            Ok(())
        });
        // Registered first, so it runs before the hooks callback releases in `after_fit`.
        learn.fit(FitConfig::new(1).valid(false).callbacks([
            callback(ForwardAfterFit),
            callback(hooks),
        ]))?;

        // one training batch, then only the training-mode pass of `after_fit`
        assert_eq!(calls.get(), 2);
        Ok(())
    }

    #[test]
    fn selection_by_name() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let hooks = HooksCallback::new(move |_, _| {
            c.set(c.get() + 1);
            Ok(())
        })
        .modules(["missing"])
        .on_valid(true);
        learn.fit(FitConfig::new(1).callback(callback(hooks)))?;
        assert_eq!(calls.get(), 0);
        Ok(())
    }

    #[test]
    fn released_on_fatal_error() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let hooks = callback(HooksCallback::new(|_, _| Ok(())));
        let result = learn.fit(FitConfig::new(1).callbacks([hooks, callback(Fail) as CallbackRef]));
        assert!(result.is_err());
        assert_eq!(attached(&learn), 0);
        Ok(())
    }

    #[test]
    fn activation_stats_per_forward_pass() -> anyhow::Result<()> {
        let mut learn = tiny_learner(3)?;
        let stats = Rc::new(RefCell::new(ActivationStats::new().on_valid(true)));
        learn.fit(FitConfig::new(1).callback(stats.clone()))?;

        let stats = stats.borrow();
        let layers = stats.stats();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].module, "fc");
        assert_eq!(layers[0].means.len(), 6);
        assert!(layers[0].hists.iter().all(|h| h.len() == HIST_BINS));

        let color = stats.color_dim(0).expect("one hooked layer");
        assert_eq!(color.len(), HIST_BINS);
        assert!(color.iter().all(|row| row.len() == 6));
        assert_eq!(stats.dead_chart(0).map(|d| d.len()), Some(6));
        assert!(stats.color_dim(1).is_none());
        Ok(())
    }

    #[test]
    fn histogram_bins() {
        let hist = histogram(&[0.0, -0.1, 0.3, 9.99, 10.0, 11.0]);
        assert_eq!(hist[0], 2.0);
        assert_eq!(hist[1], 1.0);
        assert_eq!(hist[HIST_BINS - 1], 2.0);
        assert_eq!(hist.iter().sum::<f32>(), 5.0);

        let layer = LayerStats {
            hists: vec![hist],
            ..Default::default()
        };
        assert_eq!(layer.dead_chart(), vec![0.4]);
    }
}

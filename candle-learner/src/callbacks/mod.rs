//! Callback system for training hooks.

mod checkpoint;
mod device;
mod early_stopping;
mod hooks;
mod metrics;
mod mixed_precision;
mod progress;
mod scheduler;
mod utilities;

pub use checkpoint::ModelCheckpoint;
pub use device::DeviceCallback;
pub use early_stopping::EarlyStopping;
pub use hooks::{ActivationStats, HooksCallback, LayerStats, HIST_BINS};
pub use metrics::{EpochLog, MetricsCallback};
pub use mixed_precision::{LossScaleConfig, MixedPrecisionCallback, MixedPrecisionStep};
pub use progress::ProgressCallback;
pub use scheduler::{
    BatchSchedCallback, CosineAnnealingLr, EpochSchedCallback, ExponentialLr, LrScheduler,
    RecorderCallback, SchedulerFn, StepLr,
};
pub use utilities::{BatchTransformCallback, InputStats, SingleBatchCallback};

use crate::{Error, Learner, Result};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Whether a monitored value should go down or up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

/// Points in the fit → epoch → batch nesting at which callbacks run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    BeforeFit,
    AfterFit,
    CleanupFit,
    BeforeEpoch,
    AfterEpoch,
    CleanupEpoch,
    BeforeBatch,
    AfterPredict,
    AfterLoss,
    AfterBackward,
    AfterStep,
    AfterBatch,
    CleanupBatch,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeFit => "before_fit",
            Self::AfterFit => "after_fit",
            Self::CleanupFit => "cleanup_fit",
            Self::BeforeEpoch => "before_epoch",
            Self::AfterEpoch => "after_epoch",
            Self::CleanupEpoch => "cleanup_epoch",
            Self::BeforeBatch => "before_batch",
            Self::AfterPredict => "after_predict",
            Self::AfterLoss => "after_loss",
            Self::AfterBackward => "after_backward",
            Self::AfterStep => "after_step",
            Self::AfterBatch => "after_batch",
            Self::CleanupBatch => "cleanup_batch",
        }
    }

    pub fn is_cleanup(&self) -> bool {
        matches!(self, Self::CleanupFit | Self::CleanupEpoch | Self::CleanupBatch)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An observer of the training loop.
///
/// Every hook defaults to a no-op, so implementors only write the events they care about.
/// Hooks read and mutate the learner; returning `Err(Error::Cancelled(..))` truncates the
/// matching loop level, any other error aborts the fit.
///
/// A callback stays mutably borrowed while its hook runs. Inside a hook, inspect the registry
/// with [`Learner::callback_names`] or `try_borrow`; a plain `borrow` of the running callback
/// panics. Dispatching an event from inside a hook returns [`Error::Reentrant`].
///
/// [`Error::Reentrant`]: crate::Error::Reentrant
pub trait Callback {
    /// Dispatch priority. Lower runs first; ties keep registration order.
    fn order(&self) -> i32 {
        0
    }

    fn name(&self) -> &'static str {
        "Callback"
    }

    fn before_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn cleanup_fit(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn before_epoch(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_epoch(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn cleanup_epoch(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn before_batch(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_predict(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_loss(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_backward(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_step(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn after_batch(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    fn cleanup_batch(&mut self, _learn: &mut Learner) -> Result<()> {
        Ok(())
    }

    /// Routes an event to its hook. Override to observe every event through one method.
    fn on_event(&mut self, event: Event, learn: &mut Learner) -> Result<()> {
        match event {
            Event::BeforeFit => self.before_fit(learn),
            Event::AfterFit => self.after_fit(learn),
            Event::CleanupFit => self.cleanup_fit(learn),
            Event::BeforeEpoch => self.before_epoch(learn),
            Event::AfterEpoch => self.after_epoch(learn),
            Event::CleanupEpoch => self.cleanup_epoch(learn),
            Event::BeforeBatch => self.before_batch(learn),
            Event::AfterPredict => self.after_predict(learn),
            Event::AfterLoss => self.after_loss(learn),
            Event::AfterBackward => self.after_backward(learn),
            Event::AfterStep => self.after_step(learn),
            Event::AfterBatch => self.after_batch(learn),
            Event::CleanupBatch => self.cleanup_batch(learn),
        }
    }
}

/// Shared handle to a callback. Callers keep a clone to inspect its state after a fit.
pub type CallbackRef = Rc<RefCell<dyn Callback>>;

pub fn callback(cb: impl Callback + 'static) -> CallbackRef {
    Rc::new(RefCell::new(cb))
}

/// Runs `event` on every callback in ascending `order`, stopping at the first error.
///
/// The order is recomputed on every call. A callback must not be registered twice.
pub fn run_callbacks(callbacks: &[CallbackRef], event: Event, learn: &mut Learner) -> Result<()> {
    let mut sorted = Vec::with_capacity(callbacks.len());
    for cb in callbacks {
        let order = cb
            .try_borrow()
            .map_err(|_| Error::Reentrant(event.name()))?
            .order();
        sorted.push((order, cb.clone()));
    }
    // `sort_by_key` is stable, ties keep registration order.
    sorted.sort_by_key(|(order, _)| *order);
    for (_, cb) in sorted {
        cb.try_borrow_mut()
            .map_err(|_| Error::Reentrant(event.name()))?
            .on_event(event, learn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_learner, Recorder};
    use crate::Error;
    use proptest::prelude::*;

    struct Tagged {
        tag: usize,
        order: i32,
        log: Rc<RefCell<Vec<usize>>>,
    }

    impl Callback for Tagged {
        fn order(&self) -> i32 {
            self.order
        }

        fn before_fit(&mut self, _learn: &mut Learner) -> Result<()> {
            self.log.borrow_mut().push(self.tag);
            Ok(())
        }
    }

    struct Cancels;

    impl Callback for Cancels {
        fn before_batch(&mut self, _learn: &mut Learner) -> Result<()> {
            Err(Error::cancel_epoch())
        }
    }

    #[test]
    fn empty_list_is_a_noop() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        run_callbacks(&[], Event::BeforeFit, &mut learn)?;
        Ok(())
    }

    #[test]
    fn missing_hooks_are_skipped() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let log = Rc::new(RefCell::new(Vec::new()));
        let cbs = vec![callback(Tagged {
            tag: 0,
            order: 0,
            log: log.clone(),
        })];
        run_callbacks(&cbs, Event::AfterStep, &mut learn)?;
        assert!(log.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn cancellation_passes_through_unchanged() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let rec = Rc::new(RefCell::new(Recorder::default()));
        let cbs: Vec<CallbackRef> = vec![callback(Cancels), rec.clone()];
        let err = run_callbacks(&cbs, Event::BeforeBatch, &mut learn).unwrap_err();
        assert!(err.is_cancelled(crate::Cancel::Epoch));
        // The second callback never ran.
        assert!(rec.borrow().events.is_empty());
        Ok(())
    }

    struct Redispatch(Option<Result<()>>);

    impl Callback for Redispatch {
        fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
            self.0 = Some(learn.callback(Event::AfterStep));
            Ok(())
        }
    }

    #[test]
    fn dispatch_from_a_hook_is_an_error() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let cb = Rc::new(RefCell::new(Redispatch(None)));
        learn.callbacks.push(cb.clone());
        learn.callback(Event::BeforeFit)?;
        assert!(matches!(
            cb.borrow().0,
            Some(Err(Error::Reentrant("after_step")))
        ));
        Ok(())
    }

    struct ListsCallbacks(Vec<&'static str>);

    impl Callback for ListsCallbacks {
        fn name(&self) -> &'static str {
            "ListsCallbacks"
        }

        fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
            self.0 = learn.callback_names();
            Ok(())
        }
    }

    #[test]
    fn hooks_can_list_the_registry() -> anyhow::Result<()> {
        let mut learn = tiny_learner(1)?;
        let lists = Rc::new(RefCell::new(ListsCallbacks(Vec::new())));
        learn.callbacks.push(callback(Recorder::default()));
        learn.callbacks.push(lists.clone());
        learn.fit(crate::FitConfig::new(1).valid(false))?;
        // The running callback cannot be borrowed and is left out.
        assert_eq!(lists.borrow().0, vec!["Callback"]);
        Ok(())
    }

    #[test]
    fn event_names() {
        assert_eq!(Event::AfterPredict.name(), "after_predict");
        assert_eq!(Event::CleanupBatch.to_string(), "cleanup_batch");
        assert!(Event::CleanupFit.is_cleanup());
        assert!(!Event::AfterFit.is_cleanup());
    }

    proptest! {
        #[test]
        fn dispatch_is_a_stable_sort_by_order(orders in prop::collection::vec(-3i32..3, 0..12)) {
            let mut learn = tiny_learner(1).unwrap();
            let log = Rc::new(RefCell::new(Vec::new()));
            let cbs: Vec<CallbackRef> = orders
                .iter()
                .enumerate()
                .map(|(tag, &order)| callback(Tagged { tag, order, log: log.clone() }))
                .collect();

            run_callbacks(&cbs, Event::BeforeFit, &mut learn).unwrap();

            let fired = log.borrow().clone();
            prop_assert_eq!(fired.len(), orders.len());
            for pair in fired.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                prop_assert!(orders[a] < orders[b] || (orders[a] == orders[b] && a < b));
            }
        }
    }
}

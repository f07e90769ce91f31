//! Model trait the learner trains, and a hookable sequential container.

use crate::data::Batch;
use crate::hooks::HookPoint;
use candle::{Device, Module, Result, Tensor, Var};
use candle_nn::VarMap;

/// Trait for models that can be trained by a [`Learner`](crate::Learner).
pub trait Model {
    /// `xs` is the input part of a batch. Single-input models usually start with
    /// `xs.as_tensor()?`.
    fn forward(&self, xs: &Batch) -> Result<Tensor>;

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<Var>;

    /// Switch between training (`true`) and evaluation (`false`) mode.
    fn train(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Relocate parameters. Models that are built on their target device keep the default;
    /// [`DeviceCallback`](crate::callbacks::DeviceCallback) rejects a model whose parameters
    /// are still elsewhere afterwards.
    fn to_device(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }

    /// Sub-components that accept forward hooks.
    fn modules(&self) -> Vec<HookPoint> {
        Vec::new()
    }
}

struct Layer {
    point: HookPoint,
    module: Box<dyn Module>,
}

/// Layers applied in order, each wrapped in a [`HookPoint`] named after the layer.
///
/// The layers hold their weights directly, so a `Sequential` cannot be relocated after it is
/// built; create its `VarMap` on the training device.
pub struct Sequential {
    layers: Vec<Layer>,
    varmap: VarMap,
    training: bool,
}

impl Sequential {
    /// `varmap` holds the parameters of every layer added later.
    pub fn new(varmap: VarMap) -> Self {
        Self {
            layers: Vec::new(),
            varmap,
            training: true,
        }
    }

    pub fn add(mut self, name: &str, module: impl Module + 'static) -> Self {
        self.layers.push(Layer {
            point: HookPoint::new(name),
            module: Box::new(module),
        });
        self
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Model for Sequential {
    fn forward(&self, xs: &Batch) -> Result<Tensor> {
        let mut xs = xs.as_tensor()?.clone();
        for layer in self.layers.iter() {
            let ys = layer.module.forward(&xs)?;
            layer.point.fire(&xs, &ys)?;
            xs = ys;
        }
        Ok(xs)
    }

    /// Sorted by variable name, so two identically built models list them alike.
    fn parameters(&self) -> Vec<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut named: Vec<(&String, &Var)> = data.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, v)| v.clone()).collect()
    }

    fn train(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn modules(&self) -> Vec<HookPoint> {
        self.layers.iter().map(|l| l.point.clone()).collect()
    }
}

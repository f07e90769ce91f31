//! Device placement callback.

use super::Callback;
use crate::{Error, Learner, Result};
use candle::{Device, Var};

/// Moves the model to `device` before fitting and every batch before it is used.
///
/// The fit is rejected with [`Error::InvalidConfig`] when the model could not move all of its
/// parameters, rather than failing later on the first mixed-device forward pass.
pub struct DeviceCallback {
    device: Device,
}

impl DeviceCallback {
    pub const ORDER: i32 = 0;

    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// The first CUDA device when available, the CPU otherwise.
    pub fn default_device() -> Result<Self> {
        Ok(Self::new(Device::cuda_if_available(0)?))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Callback for DeviceCallback {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "DeviceCallback"
    }

    fn before_fit(&mut self, learn: &mut Learner) -> Result<()> {
        learn.model.to_device(&self.device)?;
        let misplaced = misplaced(&learn.model.parameters(), &self.device);
        if misplaced > 0 {
            return Err(Error::InvalidConfig(format!(
                "{misplaced} model parameters are not on {:?}; build the model there or implement Model::to_device",
                self.device
            )));
        }
        Ok(())
    }

    fn before_batch(&mut self, learn: &mut Learner) -> Result<()> {
        if let Some(batch) = learn.batch.as_ref() {
            learn.batch = Some(batch.to_device(&self.device)?);
        }
        Ok(())
    }
}

fn misplaced(params: &[Var], device: &Device) -> usize {
    params
        .iter()
        .filter(|v| !v.device().same_device(device))
        .count()
}

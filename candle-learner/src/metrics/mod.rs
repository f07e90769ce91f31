//! Metrics for tracking training progress.

use candle::{DType, Result, Tensor, D};

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
    fn reset(&mut self);
}

/// Fraction of rows whose arg-max over the last dimension equals the integer target.
#[derive(Clone, Debug, Default)]
pub struct Accuracy {
    correct: f64,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Accuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let predicted = preds.argmax(D::Minus1)?;
        let targets = targets.to_dtype(predicted.dtype())?;
        let correct = predicted
            .eq(&targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        self.correct += correct as f64;
        self.total += targets.elem_count();
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            return f64::NAN;
        }
        self.correct / self.total as f64
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Weighted running mean of scalars.
#[derive(Clone, Debug, Default)]
pub struct Mean {
    sum: f64,
    weight: f64,
}

impl Mean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.sum += value * weight;
        self.weight += weight;
    }

    pub fn compute(&self) -> f64 {
        if self.weight == 0.0 {
            return f64::NAN;
        }
        self.sum / self.weight
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Mean and (unbiased) standard deviation over every element of `t`.
pub fn mean_std(t: &Tensor) -> Result<(f32, f32)> {
    let t = t.flatten_all()?.to_dtype(DType::F32)?;
    let n = t.elem_count();
    if n == 0 {
        candle::bail!("mean_std of an empty tensor");
    }
    let mean = t.mean_all()?;
    let sq = t.broadcast_sub(&mean)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
    let var = sq / (n.max(2) - 1) as f32;
    Ok((mean.to_scalar::<f32>()?, var.sqrt()))
}

//! Batches and the data sources the learner iterates over.

use candle::{Device, Result, Tensor};
use std::collections::BTreeMap;
use std::rc::Rc;

/// A batch: the first element of a tuple is the model input, the rest are targets.
///
/// Leaves are tensors; tuples and string-keyed maps may nest arbitrarily.
#[derive(Clone, Debug)]
pub enum Batch {
    Tensor(Tensor),
    Tuple(Vec<Batch>),
    Map(BTreeMap<String, Batch>),
}

impl Batch {
    /// The common `(input, target)` shape.
    pub fn pair(xs: Tensor, ys: Tensor) -> Self {
        Self::Tuple(vec![Self::Tensor(xs), Self::Tensor(ys)])
    }

    pub fn get(&self, idx: usize) -> Result<&Batch> {
        match self {
            Self::Tuple(items) => items
                .get(idx)
                .ok_or_else(|| candle::Error::Msg(format!("batch has no element {idx}"))),
            Self::Tensor(_) | Self::Map(_) if idx == 0 => Ok(self),
            _ => candle::bail!("batch element {idx} requested from a non-tuple batch"),
        }
    }

    /// Entry `key` of a map batch.
    pub fn field(&self, key: &str) -> Result<&Batch> {
        match self {
            Self::Map(items) => items
                .get(key)
                .ok_or_else(|| candle::Error::Msg(format!("batch has no field {key:?}"))),
            _ => candle::bail!("field {key:?} requested from a non-map batch"),
        }
    }

    pub fn as_tensor(&self) -> Result<&Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            Self::Tuple(_) => candle::bail!("expected a tensor leaf, found a tuple"),
            Self::Map(_) => candle::bail!("expected a tensor leaf, found a map"),
        }
    }

    pub fn input(&self) -> Result<&Tensor> {
        self.get(0)?.as_tensor()
    }

    pub fn target(&self) -> Result<&Tensor> {
        self.get(1)?.as_tensor()
    }

    /// Size of the leading dimension of the first tensor leaf.
    pub fn batch_size(&self) -> Result<usize> {
        match self.leaves().first() {
            Some(t) => t.dim(0),
            None => candle::bail!("empty batch"),
        }
    }

    /// Tensor leaves in depth-first order (maps in key order).
    pub fn leaves(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Tensor>) {
        match self {
            Self::Tensor(t) => out.push(t),
            // `as_slice` keeps `DataLoader::iter` on `Vec<Batch>` out of method resolution.
            Self::Tuple(items) => items.as_slice().iter().for_each(|b| b.collect_leaves(out)),
            Self::Map(items) => items.values().for_each(|b| b.collect_leaves(out)),
        }
    }

    /// Rebuilds the same structure with `f` applied to every leaf.
    pub fn map_tensors<F>(&self, f: &mut F) -> Result<Batch>
    where
        F: FnMut(&Tensor) -> Result<Tensor>,
    {
        Ok(match self {
            Self::Tensor(t) => Self::Tensor(f(t)?),
            Self::Tuple(items) => Self::Tuple(
                items
                    .as_slice()
                    .iter()
                    .map(|b| b.map_tensors(&mut *f))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Self::Map(items) => Self::Map(
                items
                    .iter()
                    .map(|(k, b)| Ok((k.clone(), b.map_tensors(&mut *f)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            ),
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        self.map_tensors(&mut |t| t.to_device(device))
    }
}

impl From<Tensor> for Batch {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<(Tensor, Tensor)> for Batch {
    fn from((xs, ys): (Tensor, Tensor)) -> Self {
        Self::pair(xs, ys)
    }
}

/// A finite sequence of batches that can be iterated again from the start.
pub trait DataLoader {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

impl DataLoader for Vec<Batch> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.as_slice().iter().cloned().map(Ok))
    }
}

#[derive(Clone)]
pub struct DataLoaders {
    pub train: Rc<dyn DataLoader>,
    pub valid: Rc<dyn DataLoader>,
}

impl DataLoaders {
    pub fn new(train: impl DataLoader + 'static, valid: impl DataLoader + 'static) -> Self {
        Self {
            train: Rc::new(train),
            valid: Rc::new(valid),
        }
    }
}

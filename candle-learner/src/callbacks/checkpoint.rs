//! Model checkpointing callback.

use super::{Callback, MetricsCallback, Mode};
use crate::{Learner, Result};
use candle_nn::VarMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

struct CheckpointEntry {
    metric: f64,
    path: PathBuf,
    mode: Mode,
}

impl PartialEq for CheckpointEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CheckpointEntry {}

impl PartialOrd for CheckpointEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointEntry {
    /// The heap top is the worst checkpoint, the next one to prune.
    fn cmp(&self, other: &Self) -> Ordering {
        let ordering = self.metric.total_cmp(&other.metric);
        match self.mode {
            Mode::Min => ordering,
            Mode::Max => ordering.reverse(),
        }
    }
}

/// Saves the model's variables as safetensors whenever the monitored value improves, keeping
/// the `save_top_k` best files on disk.
///
/// `varmap` is a clone of the model's [`VarMap`]; clones share storage, so the file always
/// holds the current weights.
pub struct ModelCheckpoint {
    varmap: VarMap,
    dirpath: PathBuf,
    monitor: String,
    save_top_k: usize,
    mode: Mode,
    checkpoints: BinaryHeap<CheckpointEntry>,
    best: Option<(f64, PathBuf)>,
}

impl ModelCheckpoint {
    pub const ORDER: i32 = MetricsCallback::ORDER + 1;

    pub fn new(varmap: VarMap, dirpath: impl Into<PathBuf>) -> Self {
        Self {
            varmap,
            dirpath: dirpath.into(),
            monitor: "loss".to_string(),
            save_top_k: 1,
            mode: Mode::Min,
            checkpoints: BinaryHeap::new(),
            best: None,
        }
    }

    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn save_top_k(mut self, k: usize) -> Self {
        self.save_top_k = k.max(1);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Path of the best checkpoint written so far.
    pub fn best_path(&self) -> Option<&Path> {
        self.best.as_ref().map(|(_, p)| p.as_path())
    }

    /// Paths currently kept on disk, in no particular order.
    pub fn saved(&self) -> Vec<&Path> {
        self.checkpoints.iter().map(|e| e.path.as_path()).collect()
    }

    fn is_better(&self, current: f64, best: f64) -> bool {
        match self.mode {
            Mode::Min => current < best,
            Mode::Max => current > best,
        }
    }

    fn save_checkpoint(&mut self, epoch: usize, metric: f64) -> Result<()> {
        std::fs::create_dir_all(&self.dirpath)?;

        let filename = format!("epoch_{:04}_{}_{:.4}.safetensors", epoch, self.monitor, metric);
        let path = self.dirpath.join(filename);
        self.varmap.save(&path)?;
        info!(path = %path.display(), monitor = %self.monitor, metric, "saved checkpoint");

        self.checkpoints.push(CheckpointEntry {
            metric,
            path: path.clone(),
            mode: self.mode,
        });
        self.best = Some((metric, path));

        while self.checkpoints.len() > self.save_top_k {
            if let Some(entry) = self.checkpoints.pop() {
                debug!(path = %entry.path.display(), "pruning checkpoint");
                std::fs::remove_file(&entry.path)?;
            }
        }
        Ok(())
    }
}

impl Callback for ModelCheckpoint {
    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }

    fn after_epoch(&mut self, learn: &mut Learner) -> Result<()> {
        if learn.training() {
            return Ok(());
        }
        let Some(current) = learn
            .epoch_log
            .as_ref()
            .filter(|log| log.epoch == learn.epoch && !log.train)
            .and_then(|log| log.get(&self.monitor))
        else {
            return Ok(());
        };
        if current.is_nan() {
            return Ok(());
        }

        let should_save = match &self.best {
            None => true,
            Some((best, _)) => self.is_better(current, *best),
        };
        if should_save {
            self.save_checkpoint(learn.epoch, current)?;
        }
        Ok(())
    }
}

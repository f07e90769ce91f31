// This should reach 98.5% accuracy.
use candle::{DType, Device, ModuleT, Result, Tensor, Var};
use candle_learner::callbacks::{
    ActivationStats, DeviceCallback, EarlyStopping, MetricsCallback, ProgressCallback,
};
use candle_learner::metrics::Accuracy;
use candle_learner::{callback, Batch, DataLoaders, FitConfig, HookPoint, Learner, Model};
use candle_nn::{Conv2d, Dropout, Linear, VarBuilder, VarMap};
use rand::prelude::*;
use rand::rng;
use tracing_subscriber::EnvFilter;

const LABELS: usize = 10;
const BATCH_SIZE: usize = 64;

struct ConvNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
    points: [HookPoint; 3],
    varmap: VarMap,
    training: bool,
}

impl ConvNet {
    fn new(dev: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let conv1 = candle_nn::conv2d(1, 32, 5, Default::default(), vs.pp("c1"))?;
        let conv2 = candle_nn::conv2d(32, 64, 5, Default::default(), vs.pp("c2"))?;
        let fc1 = candle_nn::linear(1024, 1024, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(1024, LABELS, vs.pp("fc2"))?;
        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
            dropout: Dropout::new(0.5),
            points: ["c1", "c2", "fc1"].map(HookPoint::new),
            varmap,
            training: true,
        })
    }
}

impl Model for ConvNet {
    fn forward(&self, xs: &Batch) -> Result<Tensor> {
        let xs = xs.as_tensor()?;
        let (b_sz, _img_dim) = xs.dims2()?;
        let xs = xs.reshape((b_sz, 1, 28, 28))?;

        let ys = xs.apply(&self.conv1)?;
        self.points[0].fire(&xs, &ys)?;
        let xs = ys.max_pool2d(2)?;

        let ys = xs.apply(&self.conv2)?;
        self.points[1].fire(&xs, &ys)?;
        let xs = ys.max_pool2d(2)?.flatten_from(1)?;

        let ys = xs.apply(&self.fc1)?.relu()?;
        self.points[2].fire(&xs, &ys)?;
        self.dropout.forward_t(&ys, self.training)?.apply(&self.fc2)
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn train(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn modules(&self) -> Vec<HookPoint> {
        self.points.to_vec()
    }
}

fn create_batches(images: &Tensor, labels: &Tensor, shuffle: bool) -> Result<Vec<Batch>> {
    let n_samples = images.dim(0)?;
    let n_batches = n_samples / BATCH_SIZE;

    let mut batch_idxs: Vec<usize> = (0..n_batches).collect();
    if shuffle {
        batch_idxs.shuffle(&mut rng());
    }

    let mut batches = Vec::with_capacity(n_batches);
    for batch_idx in batch_idxs {
        let start = batch_idx * BATCH_SIZE;
        batches.push(Batch::pair(
            images.narrow(0, start, BATCH_SIZE)?,
            labels.narrow(0, start, BATCH_SIZE)?,
        ));
    }
    Ok(batches)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let device = DeviceCallback::default_device()?;
    tracing::info!(device = ?device.device(), "using device");

    let m = candle_datasets::vision::mnist::load()?;
    tracing::info!(train = ?m.train_images.shape(), test = ?m.test_images.shape(), "loaded mnist");

    let train_labels = m.train_labels.to_dtype(DType::U32)?;
    let test_labels = m.test_labels.to_dtype(DType::U32)?;
    let dls = DataLoaders::new(
        create_batches(&m.train_images, &train_labels, true)?,
        create_batches(&m.test_images, &test_labels, false)?,
    );

    let model = ConvNet::new(device.device())?;
    let opt_fn = candle_learner::optim::adamw(candle_nn::ParamsAdamW::default());
    let metrics = MetricsCallback::new().with_metric("accuracy", Accuracy::new());
    let mut learn = Learner::new(
        model,
        dls,
        candle_learner::loss::cross_entropy(),
        0.001,
        vec![
            callback(device),
            callback(metrics),
            callback(ProgressCallback::new()),
        ],
    )
    .with_opt_fn(opt_fn);

    let stats = std::rc::Rc::new(std::cell::RefCell::new(ActivationStats::new()));
    learn.fit(
        FitConfig::new(10)
            .callback(stats.clone())
            .callback(callback(EarlyStopping::new().patience(2))),
    )?;

    for layer in stats.borrow().stats() {
        let dead = layer.dead_chart();
        let last = dead.last().copied().unwrap_or_default();
        tracing::info!(module = %layer.module, steps = dead.len(), dead = last, "activations");
    }
    Ok(())
}

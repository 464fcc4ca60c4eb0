use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use burn::{
    module::{Module, ModuleVisitor, ParamId},
    optim::GradientsParams,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use serde::{Deserialize, Serialize};

use crate::{error::Result, utils::save_montage};

const NUM_BUCKETS: usize = 30;
const MONTAGE_ROWS: usize = 4;
const MONTAGE_COLS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub buckets: Vec<u64>,
}

impl Histogram {
    /// `None` for an empty set of values.
    pub fn from_values(name: impl Into<String>, values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let (min, max, sum) = values.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(lo, hi, sum), &v| {
                let v = v as f64;
                (lo.min(v), hi.max(v), sum + v)
            },
        );
        let mean = sum / n;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;

        let mut buckets = vec![0; NUM_BUCKETS];
        let width = (max - min) / NUM_BUCKETS as f64;
        for &v in values {
            let index = if width > 0.0 {
                (((v as f64 - min) / width) as usize).min(NUM_BUCKETS - 1)
            } else {
                0
            };
            buckets[index] += 1;
        }

        Some(Self {
            name: name.into(),
            min,
            max,
            mean,
            std: var.sqrt(),
            buckets,
        })
    }

    pub fn from_tensor<B: Backend, const D: usize>(
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Option<Self> {
        let values = tensor.into_data().convert::<f32>().to_vec::<f32>().ok()?;
        Self::from_values(name, &values)
    }
}

struct ParamCollector {
    scope: String,
    histograms: Vec<Histogram>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let name = format!("{}/{}{:?}", self.scope, self.histograms.len(), tensor.dims());
        self.histograms
            .extend(Histogram::from_tensor(name, tensor.clone()));
    }
}

struct GradCollector<'a> {
    scope: String,
    grads: &'a GradientsParams,
    index: usize,
    histograms: Vec<Histogram>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradCollector<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let index = self.index;
        self.index += 1;
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let name = format!("gradients/{}/{}{:?}", self.scope, index, tensor.dims());
            self.histograms.extend(Histogram::from_tensor(name, grad));
        }
    }
}

/// One histogram per float tensor of `module`, named `{scope}/{index}[shape]`.
pub fn param_histograms<B: Backend, M: Module<B>>(scope: &str, module: &M) -> Vec<Histogram> {
    let mut collector = ParamCollector {
        scope: scope.to_string(),
        histograms: Vec::new(),
    };
    module.visit(&mut collector);
    collector.histograms
}

/// Histograms of the gradients `grads` holds for `module`'s parameters.
pub fn grad_histograms<B: AutodiffBackend, M: Module<B>>(
    scope: &str,
    module: &M,
    grads: &GradientsParams,
) -> Vec<Histogram> {
    let mut collector = GradCollector {
        scope: scope.to_string(),
        grads,
        index: 0,
        histograms: Vec::new(),
    };
    module.visit(&mut collector);
    collector.histograms
}

pub fn activation_histograms<B: Backend>(layers: &[(String, Tensor<B, 2>)]) -> Vec<Histogram> {
    layers
        .iter()
        .filter_map(|(name, tensor)| {
            Histogram::from_tensor(format!("activations/{name}"), tensor.clone())
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
    pub scalars: BTreeMap<String, f64>,
    pub histograms: Vec<Histogram>,
}

impl SummaryEvent {
    pub fn new(step: u64) -> Self {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            step,
            wall_time,
            scalars: BTreeMap::new(),
            histograms: Vec::new(),
        }
    }
}

/// Appends summary events to `{dir}/events.jsonl` and writes image montages under `{dir}/imgs`.
#[derive(Debug, Clone)]
pub struct SummaryWriter {
    dir: PathBuf,
}

impl SummaryWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    pub fn write_event(&self, event: &SummaryEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }

    /// Writes `imgs/{tag}-{step}.png` as a 4x16 grid.
    pub fn write_images<B: Backend>(&self, tag: &str, step: u64, images: Tensor<B, 4>) -> Result<()> {
        let path = self.dir.join("imgs").join(format!("{tag}-{step}.png"));
        save_montage(images, MONTAGE_ROWS, MONTAGE_COLS, path)
    }
}

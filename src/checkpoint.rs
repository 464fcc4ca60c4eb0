use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{GanError, Result};

/// Recorder used for every network, shadow and optimizer file in a checkpoint.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const GENERATOR: &str = "generator";
pub const DISCRIMINATOR: &str = "discriminator";
pub const GENERATOR_EMA: &str = "generator_ema";
pub const DISCRIMINATOR_EMA: &str = "discriminator_ema";
pub const OPTIMIZER_D: &str = "optimizer_d";
pub const OPTIMIZER_G: &str = "optimizer_g";

const PREFIX: &str = "model.ckpt-";
const INDEX_FILE: &str = "checkpoint.json";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: u64,
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl TrainingState {
    pub fn now(global_step: u64, step: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            global_step,
            step,
            timestamp,
        }
    }

    pub fn load(checkpoint: &Path) -> Result<Self> {
        let contents = fs::read_to_string(checkpoint.join(STATE_FILE))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointIndex {
    latest: Option<String>,
    all: Vec<String>,
}

fn step_of(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?.parse().ok()
}

/// Step-numbered checkpoint directories under one save directory, plus their index.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    save_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn checkpoint_dir(&self, step: u64) -> PathBuf {
        self.save_dir.join(format!("{PREFIX}{step}"))
    }

    fn read_index(&self) -> Result<CheckpointIndex> {
        let path = self.save_dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(CheckpointIndex::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        let tmp = self.save_dir.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(index)?)?;
        fs::rename(tmp, self.save_dir.join(INDEX_FILE))?;
        Ok(())
    }

    /// Most recently saved checkpoint, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self
            .read_index()?
            .latest
            .map(|name| self.save_dir.join(name)))
    }

    /// Every indexed checkpoint, in ascending step order.
    pub fn all(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .read_index()?
            .all
            .into_iter()
            .map(|name| self.save_dir.join(name))
            .collect())
    }

    /// Writes checkpoint `step` through `write` into a staging directory, then moves it into
    /// place together with its `state.json` and updates the index.
    pub fn save<F>(&self, state: &TrainingState, write: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let name = format!("{PREFIX}{}", state.step);
        let target = self.save_dir.join(&name);
        let staging = self.save_dir.join(format!("{name}.partial"));

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        write(&staging)?;
        fs::write(
            staging.join(STATE_FILE),
            serde_json::to_string_pretty(state)?,
        )?;

        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;

        let mut index = self.read_index()?;
        if !index.all.contains(&name) {
            index.all.push(name.clone());
        }
        index.all.sort_by_key(|name| step_of(name).unwrap_or_default());
        index.latest = Some(name);
        self.write_index(&index)?;

        tracing::debug!(checkpoint = %target.display(), "checkpoint written");
        Ok(target)
    }
}

/// Resolves a user supplied checkpoint argument: a checkpoint directory is used as is,
/// a save directory resolves to its latest checkpoint.
pub fn resolve_checkpoint(path: &Path) -> Result<PathBuf> {
    if path.join(STATE_FILE).is_file() {
        return Ok(path.to_path_buf());
    }
    CheckpointStore::new(path)
        .latest()?
        .filter(|checkpoint| checkpoint.is_dir())
        .ok_or_else(|| GanError::CheckpointNotFound(path.to_path_buf()))
}

/// Tensors a pretrained record supplied to a module, and those it could not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub restored: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct Tensors<B: Backend>(VecDeque<(Vec<usize>, Tensor<B, 1>)>);

impl<B: Backend> ModuleVisitor<B> for Tensors<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.0
            .push_back((tensor.dims().to_vec(), tensor.clone().flatten(0, D - 1)));
    }
}

struct TakeMatching<B: Backend> {
    source: VecDeque<(Vec<usize>, Tensor<B, 1>)>,
    stats: RestoreStats,
}

impl<B: Backend> ModuleMapper<B> for TakeMatching<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.source.pop_front() {
            Some((dims, value)) if dims == tensor.dims() => {
                self.stats.restored += 1;
                value.reshape(tensor.shape())
            }
            Some((dims, _)) => {
                tracing::warn!(
                    %id,
                    expected = ?tensor.dims(),
                    found = ?dims,
                    "pretrained tensor has another shape, keeping the current value"
                );
                self.stats.skipped += 1;
                tensor
            }
            None => {
                self.stats.skipped += 1;
                tensor
            }
        }
    }
}

/// Loads the record at `path` and takes over each of its tensors whose shape matches the
/// tensor at the same position of `module`. The others keep their current values.
///
/// A record that does not decode into `module`'s type is an error. A record whose tensor
/// count differs cannot be paired up and leaves `module` untouched.
pub fn load_matching<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<(M, RestoreStats)> {
    let source = module
        .clone()
        .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)?;

    let mut source_tensors = Tensors::default();
    source.visit(&mut source_tensors);
    let mut current = Tensors::<B>::default();
    module.visit(&mut current);

    if source_tensors.0.len() != current.0.len() {
        tracing::warn!(
            path = %path.display(),
            expected = current.0.len(),
            found = source_tensors.0.len(),
            "pretrained record has another layout, keeping the current values"
        );
        let stats = RestoreStats {
            restored: 0,
            skipped: current.0.len(),
        };
        return Ok((module, stats));
    }

    let mut mapper = TakeMatching {
        source: source_tensors.0,
        stats: RestoreStats::default(),
    };
    let module = module.map(&mut mapper);
    Ok((module, mapper.stats))
}

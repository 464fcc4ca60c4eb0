use std::{
    collections::{HashSet, VecDeque},
    path::Path,
};

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{backend::Backend, Tensor},
};

use crate::{checkpoint::CheckpointRecorder, error::Result};

/// Ids of the tensors an optimizer updates; batch-norm running statistics are not among
/// them. Only meaningful on an autodiff backend, where parameters require gradients.
pub fn trainable_ids<B: Backend, M: Module<B>>(module: &M) -> HashSet<ParamId> {
    struct Trainable(HashSet<ParamId>);

    impl<B: Backend> ModuleVisitor<B> for Trainable {
        fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
            if tensor.is_require_grad() {
                self.0.insert(id);
            }
        }
    }

    let mut visitor = Trainable(HashSet::new());
    module.visit(&mut visitor);
    visitor.0
}

/// Shadow copy of a module whose trainable tensors track an exponential moving average
/// of the raw module's values. Every other float tensor, such as batch-norm running
/// statistics, is copied from the raw module as is.
///
/// With warm-up, the effective decay after `n` updates is
/// `min(decay, (1 + n) / (10 + n))`.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage<B: Backend, M: Module<B>> {
    decay: f64,
    shadow: M,
    trainable: HashSet<ParamId>,
    _backend: std::marker::PhantomData<B>,
}

struct Collector<B: Backend> {
    values: VecDeque<(ParamId, Tensor<B, 1>)>,
}

impl<B: Backend> ModuleVisitor<B> for Collector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.values.push_back((id, tensor.clone().flatten(0, D - 1)));
    }
}

struct Blend<'a, B: Backend> {
    values: VecDeque<(ParamId, Tensor<B, 1>)>,
    trainable: &'a HashSet<ParamId>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<'_, B> {
    // Shadow and raw module share a structure, so visiting order pairs their tensors.
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.values.pop_front() {
            Some((id, value)) => {
                let value: Tensor<B, D> = value.reshape(tensor.shape());
                if self.trainable.contains(&id) {
                    tensor * self.decay + value * (1.0 - self.decay)
                } else {
                    value
                }
            }
            None => tensor,
        }
    }
}

impl<B: Backend, M: Module<B>> ExponentialMovingAverage<B, M> {
    /// Starts with the shadow equal to `module`. `trainable` names the raw module's
    /// tensors to average, see [`trainable_ids`].
    pub fn new(decay: f64, module: &M, trainable: HashSet<ParamId>) -> Self {
        Self {
            decay,
            shadow: module.clone(),
            trainable,
            _backend: std::marker::PhantomData,
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// Decay used for the update that follows `num_updates` previous ones.
    pub fn effective_decay(&self, num_updates: Option<u64>) -> f64 {
        match num_updates {
            Some(n) => {
                let n = n as f64;
                self.decay.min((1.0 + n) / (10.0 + n))
            }
            None => self.decay,
        }
    }

    /// `shadow = decay * shadow + (1 - decay) * raw` for trainable tensors,
    /// `shadow = raw` for the rest.
    pub fn apply(&mut self, raw: &M, num_updates: Option<u64>) {
        let mut collector = Collector {
            values: VecDeque::new(),
        };
        raw.visit(&mut collector);

        let mut blend = Blend {
            values: collector.values,
            trainable: &self.trainable,
            decay: self.effective_decay(num_updates),
        };
        self.shadow = self.shadow.clone().map(&mut blend);
    }

    pub fn shadow(&self) -> &M {
        &self.shadow
    }

    /// Follows a raw module whose parameter ids changed, e.g. after loading a record.
    pub fn track(&mut self, trainable: HashSet<ParamId>) {
        self.trainable = trainable;
    }

    /// Replaces the shadow, e.g. after its raw module was restored from elsewhere.
    pub fn reset(&mut self, module: &M, trainable: HashSet<ParamId>) {
        self.shadow = module.clone();
        self.trainable = trainable;
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.shadow
            .clone()
            .save_file(path.to_path_buf(), &CheckpointRecorder::new())?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path, device: &B::Device) -> Result<()> {
        self.shadow = self
            .shadow
            .clone()
            .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)?;
        Ok(())
    }
}

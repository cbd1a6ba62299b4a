//! Replay buffer of sampled [`Experience`].
use crate::experience::Experience;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use tch::{Device, Kind};
use twirl_core::{error::TwirlError, DistributedStrategy, ExperienceBufferBase, ReplayBufferBase};

/// Configuration of [`TwistReplayBuffer`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct TwistReplayBufferConfig {
    /// Number of sequences per mini-batch.
    pub sample_batch_size: usize,

    /// Maximum number of buffered rollouts; the oldest rollout is
    /// dropped when exceeded. `0` means unbounded.
    pub limit: usize,

    /// Move appended experience to CPU memory until training.
    pub cpu_offload: bool,
}

impl Default for TwistReplayBufferConfig {
    fn default() -> Self {
        Self {
            sample_batch_size: 8,
            limit: 0,
            cpu_offload: true,
        }
    }
}

impl TwistReplayBufferConfig {
    /// Sets the mini-batch size.
    pub fn sample_batch_size(mut self, v: usize) -> Self {
        self.sample_batch_size = v;
        self
    }

    /// Sets the maximum number of buffered rollouts.
    pub fn limit(mut self, v: usize) -> Self {
        self.limit = v;
        self
    }

    /// Sets CPU offloading.
    pub fn cpu_offload(mut self, v: bool) -> Self {
        self.cpu_offload = v;
        self
    }

    /// Constructs [`TwistReplayBufferConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`TwistReplayBufferConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Buffers rollouts between collection and the optimization pass.
///
/// Mini-batches keep arrival order; the trainer relies on this when it
/// zips the mini-batches of two buffers into pairs.
pub struct TwistReplayBuffer {
    config: TwistReplayBufferConfig,
    items: Vec<Experience>,
}

impl TwistReplayBuffer {
    /// Constructs an empty buffer.
    pub fn new(config: TwistReplayBufferConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
        }
    }
}

impl ExperienceBufferBase for TwistReplayBuffer {
    type Item = Experience;

    fn len(&self) -> usize {
        self.items.len()
    }

    fn append(&mut self, item: Experience) {
        let item = if self.config.cpu_offload {
            item.to_device(Device::Cpu)
        } else {
            item
        };
        self.items.push(item);
        if self.config.limit > 0 && self.items.len() > self.config.limit {
            self.items.remove(0);
        }
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

impl ReplayBufferBase for TwistReplayBuffer {
    /// Standardizes the named per-sequence field to zero mean and unit
    /// variance across all buffered sequences of all processes.
    fn normalize(
        &mut self,
        key: &str,
        strategy: &dyn DistributedStrategy,
    ) -> Result<(), TwirlError> {
        let mut xs = [0.0f64; 3];
        for item in &self.items {
            let field = item.info.get(key).ok_or_else(|| {
                TwirlError::Config(format!("unknown experience field: {}", key))
            })?;
            xs[0] += f64::try_from(field.sum(Kind::Float)).unwrap();
            xs[1] += f64::try_from(field.pow_tensor_scalar(2.0).sum(Kind::Float)).unwrap();
            xs[2] += field.numel() as f64;
        }
        strategy.all_reduce_sum(&mut xs)?;
        if xs[2] == 0.0 {
            return Ok(());
        }

        let mean = xs[0] / xs[2];
        let var = (xs[1] / xs[2] - mean * mean).max(1e-8);
        let rstd = var.sqrt().recip();

        for item in &mut self.items {
            if let Some(field) = item.info.get_mut(key) {
                *field = (&*field - mean) * rstd;
            }
        }
        Ok(())
    }

    /// Concatenates the buffered rollouts and re-chunks them into
    /// mini-batches, preserving arrival order. A trailing chunk smaller
    /// than `sample_batch_size` is dropped.
    fn minibatches(&self) -> Result<Vec<Experience>, TwirlError> {
        if self.items.is_empty() {
            return Ok(Vec::new());
        }
        let all = Experience::cat(&self.items)?;
        Ok(all.split(self.config.sample_batch_size as i64))
    }
}

//! Configuration of [`HarmlessnessTrainer`](super::HarmlessnessTrainer).
use crate::error::TwirlError;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`HarmlessnessTrainer`](super::HarmlessnessTrainer).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct TrainerConfig {
    /// Number of continuations sampled per prompt. Mini-batches are
    /// grouped by prompt with this many samples per group.
    pub samples_per_prompt: usize,

    /// Number of sequences per rollout, used to scale KL controller
    /// updates.
    pub rollout_batch_size: usize,

    /// Number of rollouts to accumulate before an optimization pass.
    pub update_timesteps: usize,

    /// Number of passes over the buffered experience per optimization
    /// pass.
    pub max_epochs: usize,

    /// Per-sequence field standardized across the buffer before
    /// training; `None` disables normalization.
    pub normalize_field: Option<String>,

    /// Initial KL penalty coefficient.
    pub init_kl_coef: f64,

    /// Target KL divergence; enables the adaptive controller when set.
    pub kl_target: Option<f64>,

    /// Horizon of the adaptive KL controller, in consumed samples.
    pub kl_horizon: f64,

    /// Interval of saving checkpoints in outer iterations; 0 disables
    /// saving.
    pub save_interval: usize,

    /// Deferred: optimize actor and critic through a shared trunk.
    pub shared_actor_critic: bool,

    /// Deferred: coefficient of a behavior-cloning term.
    pub behavior_cloning_coef: f64,

    /// Deferred: coefficient of a pretrain-mixing (ptx) term.
    pub pretrain_mixing_coef: f64,

    /// Deferred: train on a single hardcoded prompt.
    pub custom_single_prompt: bool,

    /// Deferred: train the critic/twist alongside the actor.
    pub train_critic: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            samples_per_prompt: 1,
            rollout_batch_size: 8,
            update_timesteps: 1,
            max_epochs: 1,
            normalize_field: Some("reward".to_string()),
            init_kl_coef: 0.001,
            kl_target: None,
            kl_horizon: 10000.0,
            save_interval: 0,
            shared_actor_critic: false,
            behavior_cloning_coef: 0.0,
            pretrain_mixing_coef: 0.0,
            custom_single_prompt: false,
            train_critic: false,
        }
    }
}

impl TrainerConfig {
    /// Sets the number of continuations sampled per prompt.
    pub fn samples_per_prompt(mut self, v: usize) -> Self {
        self.samples_per_prompt = v;
        self
    }

    /// Sets the rollout batch size.
    pub fn rollout_batch_size(mut self, v: usize) -> Self {
        self.rollout_batch_size = v;
        self
    }

    /// Sets the number of rollouts per optimization pass.
    pub fn update_timesteps(mut self, v: usize) -> Self {
        self.update_timesteps = v;
        self
    }

    /// Sets the number of epochs per optimization pass.
    pub fn max_epochs(mut self, v: usize) -> Self {
        self.max_epochs = v;
        self
    }

    /// Sets the normalized field.
    pub fn normalize_field(mut self, v: Option<String>) -> Self {
        self.normalize_field = v;
        self
    }

    /// Sets the initial KL penalty coefficient.
    pub fn init_kl_coef(mut self, v: f64) -> Self {
        self.init_kl_coef = v;
        self
    }

    /// Sets the target KL divergence.
    pub fn kl_target(mut self, v: Option<f64>) -> Self {
        self.kl_target = v;
        self
    }

    /// Sets the horizon of the adaptive KL controller.
    pub fn kl_horizon(mut self, v: f64) -> Self {
        self.kl_horizon = v;
        self
    }

    /// Sets the checkpoint interval in outer iterations.
    pub fn save_interval(mut self, v: usize) -> Self {
        self.save_interval = v;
        self
    }

    /// Rejects inconsistent configurations and deferred features.
    pub fn validate(&self) -> Result<(), TwirlError> {
        if self.samples_per_prompt == 0 {
            return Err(TwirlError::Config(
                "samples_per_prompt must be positive".into(),
            ));
        }
        if self.update_timesteps == 0 {
            return Err(TwirlError::Config(
                "update_timesteps must be positive".into(),
            ));
        }
        if self.max_epochs == 0 {
            return Err(TwirlError::Config("max_epochs must be positive".into()));
        }
        if self.shared_actor_critic {
            return Err(TwirlError::Unsupported("shared actor-critic".into()));
        }
        if self.behavior_cloning_coef != 0.0 {
            return Err(TwirlError::Unsupported("behavior cloning".into()));
        }
        if self.pretrain_mixing_coef != 0.0 {
            return Err(TwirlError::Unsupported("pretrain-mixing (ptx) loss".into()));
        }
        if self.custom_single_prompt {
            return Err(TwirlError::Unsupported("custom single prompt mode".into()));
        }
        if self.train_critic {
            return Err(TwirlError::Unsupported("critic training".into()));
        }
        Ok(())
    }

    /// Constructs [`TrainerConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`TrainerConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_serde_trainer_config() -> anyhow::Result<()> {
        let config = TrainerConfig::default()
            .samples_per_prompt(4)
            .max_epochs(2)
            .kl_target(Some(6.0))
            .save_interval(10);

        let dir = TempDir::new("trainer_config")?;
        let path = dir.path().join("trainer_config.yaml");

        config.save(&path)?;
        let config_ = TrainerConfig::load(&path)?;
        assert_eq!(config, config_);
        Ok(())
    }

    #[test]
    fn test_deferred_features_rejected() {
        let mut config = TrainerConfig::default();
        config.train_critic = true;
        assert!(matches!(
            config.validate(),
            Err(TwirlError::Unsupported(_))
        ));

        let mut config = TrainerConfig::default();
        config.behavior_cloning_coef = 0.1;
        assert!(matches!(
            config.validate(),
            Err(TwirlError::Unsupported(_))
        ));

        let mut config = TrainerConfig::default();
        config.custom_single_prompt = true;
        assert!(matches!(
            config.validate(),
            Err(TwirlError::Unsupported(_))
        ));
    }

    #[test]
    fn test_zero_epochs_rejected() {
        let mut config = TrainerConfig::default();
        config.max_epochs = 0;
        assert!(matches!(config.validate(), Err(TwirlError::Config(_))));
    }
}

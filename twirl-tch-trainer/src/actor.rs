//! Actor training against the twisted target.
use crate::{
    experience::Experience,
    loss::{ActorLoss, ActorLossConfig},
    opt::{Optimizer, OptimizerConfig},
    util::track,
    weights,
    weights::BatchLayout,
};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    fs,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};
use tch::{nn::VarStore, no_grad, Device, Kind, Tensor};
use twirl_core::{
    error::TwirlError,
    record::{Record, RecordValue::Scalar},
    DualBatchAgent,
};

/// Interface of neural networks backed by a [`VarStore`].
pub trait ModelBase {
    /// Returns the var store of the model.
    fn get_var_store(&self) -> &VarStore;

    /// Returns the var store of the model.
    fn get_var_store_mut(&mut self) -> &mut VarStore;

    /// Saves the model.
    fn save<T: AsRef<Path>>(&self, path: T) -> Result<()>;

    /// Loads the model.
    fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()>;
}

/// A policy over token sequences.
pub trait PolicyModel: ModelBase {
    /// Per-token log-probabilities of the last `num_actions` tokens of
    /// `sequences` under the policy, shape `(batch, num_actions)`.
    fn action_log_probs(
        &self,
        sequences: &Tensor,
        num_actions: i64,
        attention_mask: &Tensor,
    ) -> Tensor;

    /// Switches between training and evaluation mode. No-op by default.
    fn set_train(&mut self, _train: bool) {}
}

/// Configuration of [`ActorTrainer`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ActorTrainerConfig {
    /// Actor loss.
    pub loss: ActorLossConfig,

    /// Optimizer of the policy parameters.
    pub opt_config: OptimizerConfig,

    /// Number of continuations sampled per prompt; mini-batches are
    /// regrouped by prompt with this many samples per group.
    pub samples_per_prompt: usize,

    /// Decay of the exponential moving average of the policy weights;
    /// `None` disables the EMA.
    pub ema_decay: Option<f64>,

    /// Keep the policy in evaluation mode during training steps
    /// (disables dropout).
    pub model_eval: bool,
}

impl Default for ActorTrainerConfig {
    fn default() -> Self {
        Self {
            loss: ActorLossConfig::Reinforce {
                baseline: crate::loss::Baseline::BatchMean,
            },
            opt_config: OptimizerConfig::default(),
            samples_per_prompt: 1,
            ema_decay: None,
            model_eval: false,
        }
    }
}

impl ActorTrainerConfig {
    /// Sets the actor loss.
    pub fn loss(mut self, v: ActorLossConfig) -> Self {
        self.loss = v;
        self
    }

    /// Sets the optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Sets the number of continuations sampled per prompt.
    pub fn samples_per_prompt(mut self, v: usize) -> Self {
        self.samples_per_prompt = v;
        self
    }

    /// Sets the EMA decay.
    pub fn ema_decay(mut self, v: Option<f64>) -> Self {
        self.ema_decay = v;
        self
    }

    /// Sets evaluation mode during training steps.
    pub fn model_eval(mut self, v: bool) -> Self {
        self.model_eval = v;
        self
    }

    /// Rejects inconsistent configurations.
    pub fn validate(&self) -> Result<(), TwirlError> {
        if self.samples_per_prompt == 0 {
            return Err(TwirlError::Config(
                "samples_per_prompt must be positive".into(),
            ));
        }
        if let Some(decay) = self.ema_decay {
            if !(0.0..1.0).contains(&decay) {
                return Err(TwirlError::Config(format!(
                    "ema_decay must lie in [0, 1), got {}",
                    decay
                )));
            }
        }
        self.loss.build().map(|_| ())
    }

    /// Constructs [`ActorTrainerConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`ActorTrainerConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Performs policy-gradient steps on paired experience mini-batches.
///
/// Holds the trainable policy, an optional frozen base policy (required
/// by losses that reweight the negative stream toward the twisted
/// target), and an optional EMA copy of the policy.
pub struct ActorTrainer<P: PolicyModel> {
    policy: P,

    /// Frozen reference policy; scores negative-stream samples for the
    /// importance weights.
    base_policy: Option<P>,

    ema_policy: Option<P>,
    ema_decay: f64,
    opt: Optimizer,
    loss: ActorLoss,
    samples_per_prompt: i64,
    model_eval: bool,
    device: Device,

    /// Optimizer steps done by this trainer instance, reset only when
    /// the instance is rebuilt.
    n_opt_steps: usize,
}

impl<P: PolicyModel> ActorTrainer<P> {
    /// Constructs a trainer. Fails if the configuration is inconsistent
    /// or if the configured loss needs a base policy that was not given.
    pub fn build(
        config: ActorTrainerConfig,
        policy: P,
        base_policy: Option<P>,
        ema_policy: Option<P>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let loss = config.loss.build()?;
        if loss.needs_negative_stream() && base_policy.is_none() {
            return Err(TwirlError::Config(
                "the configured loss consumes the negative stream and requires a base policy"
                    .into(),
            )
            .into());
        }
        let opt = config.opt_config.build(policy.get_var_store())?;
        Ok(Self {
            policy,
            base_policy,
            ema_policy,
            ema_decay: config.ema_decay.unwrap_or(0.0),
            opt,
            loss,
            samples_per_prompt: config.samples_per_prompt as i64,
            model_eval: config.model_eval,
            device,
            n_opt_steps: 0,
        })
    }

    /// Returns the trained policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Returns the EMA copy of the policy, if enabled.
    pub fn ema_policy(&self) -> Option<&P> {
        self.ema_policy.as_ref()
    }

    /// Returns the number of optimizer steps done so far.
    pub fn n_opt_steps(&self) -> usize {
        self.n_opt_steps
    }

    /// Saves the policy (and its EMA copy) under the given directory.
    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        self.policy.save(path.join("actor.pt"))?;
        if let Some(ema) = &self.ema_policy {
            ema.save(path.join("actor_ema.pt"))?;
        }
        info!("saved actor to {:?}", path);
        Ok(())
    }

    /// Loads the policy (and its EMA copy) from the given directory.
    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.policy.load(path.join("actor.pt"))?;
        if let Some(ema) = self.ema_policy.as_mut() {
            ema.load(path.join("actor_ema.pt"))?;
        }
        info!("loaded actor from {:?}", path);
        Ok(())
    }

    fn num_prompts(&self, batch_size: i64) -> Result<i64, TwirlError> {
        if batch_size % self.samples_per_prompt != 0 {
            return Err(TwirlError::Config(format!(
                "batch size {} is not divisible by samples_per_prompt {}",
                batch_size, self.samples_per_prompt
            )));
        }
        Ok(batch_size / self.samples_per_prompt)
    }

    fn group_tokens(&self, t: &Tensor) -> Result<Tensor, TwirlError> {
        let num_prompts = self.num_prompts(t.size()[0])?;
        Ok(t.reshape(&[num_prompts, self.samples_per_prompt, -1]))
    }

    fn group_sequences(&self, t: &Tensor) -> Result<Tensor, TwirlError> {
        let num_prompts = self.num_prompts(t.size()[0])?;
        Ok(t.reshape(&[num_prompts, self.samples_per_prompt]))
    }

    /// Log-probs of the negative stream under the trained policy
    /// (differentiable) and the frozen base policy (detached), grouped.
    fn negative_stream(&self, exp_neg: &Experience) -> Result<(Tensor, Tensor), TwirlError> {
        let base_policy = self.base_policy.as_ref().ok_or_else(|| {
            TwirlError::Config("negative stream requested without a base policy".into())
        })?;
        let num_actions = exp_neg.num_actions();
        let logp_neg = self.policy.action_log_probs(
            &exp_neg.sequences,
            num_actions,
            &exp_neg.attention_mask,
        );
        let base_logp_neg = no_grad(|| {
            base_policy
                .action_log_probs(&exp_neg.sequences, num_actions, &exp_neg.attention_mask)
                .detach()
        });
        Ok((self.group_tokens(&logp_neg)?, self.group_tokens(&base_logp_neg)?))
    }

    fn status(&self, loss: Tensor, experience: &Experience) -> Record {
        let mean = |t: &Tensor| f32::try_from(t.mean(Kind::Float)).unwrap();
        // Weight the KL by response length so short sequences do not
        // dominate the batch statistic.
        let len = &experience.info.response_length;
        let kl = (&experience.info.kl * len).sum(Kind::Float)
            / len.sum(Kind::Float).clamp_min(f64::EPSILON);
        let mut record = Record::empty();
        record.insert("actor_loss", Scalar(f32::try_from(loss).unwrap()));
        record.insert("reward", Scalar(mean(&experience.info.reward)));
        record.insert(
            "untransformed_reward",
            Scalar(mean(&experience.info.untransformed_reward)),
        );
        record.insert("kl", Scalar(f32::try_from(kl).unwrap()));
        record.insert(
            "response_length",
            Scalar(mean(&experience.info.response_length)),
        );
        record.insert("total_length", Scalar(mean(&experience.info.total_length)));
        record.insert("actor_lr", Scalar(self.opt.learning_rate() as f32));
        record
    }
}

impl<P: PolicyModel> DualBatchAgent for ActorTrainer<P> {
    type Experience = Experience;

    fn needs_negative_stream(&self) -> bool {
        self.loss.needs_negative_stream()
    }

    fn train_step(
        &mut self,
        experience: &Experience,
        experience_neg: &Experience,
    ) -> Result<Record> {
        self.policy.set_train(!self.model_eval);

        let exp = experience.to_device(self.device);
        let num_actions = exp.num_actions();
        let logp = self
            .policy
            .action_log_probs(&exp.sequences, num_actions, &exp.attention_mask);
        let logp = self.group_tokens(&logp)?;
        let reward = self.group_sequences(&exp.info.reward)?;
        let mask = self.group_tokens(&exp.action_mask.to_kind(Kind::Float))?;

        let loss = match &self.loss {
            ActorLoss::Reinforce(l) => l.forward(&logp, &reward, &mask)?,
            ActorLoss::NegTraining(l) => {
                let exp_neg = experience_neg.to_device(self.device);
                let (logp_neg, base_logp_neg) = self.negative_stream(&exp_neg)?;
                let mask_neg = self.group_tokens(&exp_neg.action_mask.to_kind(Kind::Float))?;
                let sampling_neg = self.group_tokens(&exp_neg.action_log_probs)?;
                let reward_neg = self.group_sequences(&exp_neg.info.reward)?;
                let sigma_weights = weights::normalized_positive_weights(
                    &(base_logp_neg * &mask_neg),
                    &sampling_neg,
                    &reward_neg,
                    BatchLayout::GroupedByPrompt,
                )?;
                l.forward(&logp, &logp_neg, &reward, &sigma_weights, &mask, &mask_neg)?
            }
            ActorLoss::NegReinforce(l) => {
                let exp_neg = experience_neg.to_device(self.device);
                let (logp_neg, base_logp_neg) = self.negative_stream(&exp_neg)?;
                let mask_neg = self.group_tokens(&exp_neg.action_mask.to_kind(Kind::Float))?;
                let sampling_neg = self.group_tokens(&exp_neg.action_log_probs)?;
                let reward_neg = self.group_sequences(&exp_neg.info.reward)?;
                let sigma_weights = weights::normalized_positive_weights(
                    &(base_logp_neg * &mask_neg),
                    &sampling_neg,
                    &reward_neg,
                    BatchLayout::GroupedByPrompt,
                )?;
                l.forward(
                    &logp,
                    &logp_neg,
                    &reward,
                    &reward_neg,
                    &sigma_weights,
                    &mask,
                    &mask_neg,
                )?
            }
        };

        self.opt.backward_step(&loss);
        self.n_opt_steps += 1;

        if let Some(ema) = self.ema_policy.as_mut() {
            track(ema, &mut self.policy, 1.0 - self.ema_decay);
        }

        Ok(self.status(loss, &exp))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::loss::Baseline;
    use tch::nn;

    /// A policy whose per-token log-prob is a single learned bias.
    pub(crate) struct ToyPolicy {
        vs: VarStore,
        bias: Tensor,
    }

    impl ToyPolicy {
        pub(crate) fn new() -> Self {
            let vs = VarStore::new(Device::Cpu);
            let bias = vs.root().var("bias", &[1], nn::Init::Const(0.0));
            Self { vs, bias }
        }

        pub(crate) fn bias_value(&self) -> f64 {
            f64::try_from(&self.bias).unwrap()
        }
    }

    impl ModelBase for ToyPolicy {
        fn get_var_store(&self) -> &VarStore {
            &self.vs
        }

        fn get_var_store_mut(&mut self) -> &mut VarStore {
            &mut self.vs
        }

        fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
            self.vs.save(path)?;
            Ok(())
        }

        fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
            self.vs.load(path)?;
            Ok(())
        }
    }

    impl PolicyModel for ToyPolicy {
        fn action_log_probs(
            &self,
            sequences: &Tensor,
            num_actions: i64,
            _attention_mask: &Tensor,
        ) -> Tensor {
            let batch_size = sequences.size()[0];
            Tensor::ones(&[batch_size, num_actions], tch::kind::FLOAT_CPU) * -1.0 + &self.bias
        }
    }

    fn reinforce_config() -> ActorTrainerConfig {
        ActorTrainerConfig::default()
            .loss(ActorLossConfig::Reinforce {
                baseline: Baseline::None,
            })
            .opt_config(OptimizerConfig::Adam { lr: 0.1 })
            .samples_per_prompt(2)
    }

    #[test]
    fn test_train_step_updates_policy() -> Result<()> {
        let mut trainer = ActorTrainer::build(
            reinforce_config(),
            ToyPolicy::new(),
            None,
            None,
            Device::Cpu,
        )?;
        assert!(!trainer.needs_negative_stream());

        let exp = crate::experience::tests::dummy_experience(4, 8);
        let status = trainer.train_step(&exp, &exp)?;

        assert_eq!(trainer.n_opt_steps(), 1);
        assert!(status.get_scalar("actor_loss").is_ok());
        assert!(status.get_scalar("kl").is_ok());
        assert!(status.get_scalar("response_length").is_ok());
        // Positive rewards with no baseline push the log-probs up.
        assert!(trainer.policy().bias_value() > 0.0);
        Ok(())
    }

    #[test]
    fn test_kl_status_is_response_length_weighted() -> Result<()> {
        let mut trainer = ActorTrainer::build(
            reinforce_config(),
            ToyPolicy::new(),
            None,
            None,
            Device::Cpu,
        )?;

        let mut exp = crate::experience::tests::dummy_experience(2, 8);
        exp.info.kl = Tensor::from_slice(&[10.0f32, 0.0]);
        exp.info.response_length = Tensor::from_slice(&[1.0f32, 100.0]);

        // The long sequence with zero KL dominates; a plain batch mean
        // would report 5.0 instead.
        let status = trainer.train_step(&exp.clone(), &exp)?;
        let kl = status.get_scalar("kl")?;
        assert!((kl - 10.0 / 101.0).abs() < 1e-4, "{}", kl);
        Ok(())
    }

    #[test]
    fn test_ema_policy_lags_behind() -> Result<()> {
        let config = reinforce_config().ema_decay(Some(0.5));
        let mut trainer = ActorTrainer::build(
            config,
            ToyPolicy::new(),
            None,
            Some(ToyPolicy::new()),
            Device::Cpu,
        )?;

        let exp = crate::experience::tests::dummy_experience(4, 8);
        trainer.train_step(&exp, &exp)?;

        let policy_bias = trainer.policy().bias_value();
        let ema_bias = trainer.ema_policy().unwrap().bias_value();
        assert!(policy_bias > 0.0);
        assert!((ema_bias - 0.5 * policy_bias).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_negative_loss_requires_base_policy() {
        let config = reinforce_config().loss(ActorLossConfig::NegTraining {
            alpha: 0.5,
            baseline: Baseline::None,
        });
        assert!(
            ActorTrainer::build(config, ToyPolicy::new(), None, None, Device::Cpu).is_err()
        );
    }

    #[test]
    fn test_neg_training_step() -> Result<()> {
        let config = reinforce_config().loss(ActorLossConfig::NegTraining {
            alpha: 0.5,
            baseline: Baseline::BatchMean,
        });
        let mut trainer = ActorTrainer::build(
            config,
            ToyPolicy::new(),
            Some(ToyPolicy::new()),
            None,
            Device::Cpu,
        )?;
        assert!(trainer.needs_negative_stream());

        let exp = crate::experience::tests::dummy_experience(4, 8);
        let exp_neg = crate::experience::tests::dummy_experience(4, 8);
        let status = trainer.train_step(&exp, &exp_neg)?;
        assert!(status.get_scalar("actor_loss").is_ok());
        Ok(())
    }

    #[test]
    fn test_indivisible_batch_is_rejected() -> Result<()> {
        let config = reinforce_config().samples_per_prompt(3);
        let mut trainer = ActorTrainer::build(
            config,
            ToyPolicy::new(),
            None,
            None,
            Device::Cpu,
        )?;
        let exp = crate::experience::tests::dummy_experience(4, 8);
        assert!(trainer.train_step(&exp, &exp).is_err());
        Ok(())
    }

    #[test]
    fn test_serde_actor_trainer_config() -> Result<()> {
        let config = reinforce_config()
            .ema_decay(Some(0.99))
            .loss(ActorLossConfig::NegReinforce {
                alpha: 0.3,
                baseline: Baseline::BatchMean,
                baseline_neg: Baseline::Hardcoded(1.0),
            });

        let dir = tempdir::TempDir::new("actor_config")?;
        let path = dir.path().join("actor_trainer_config.yaml");

        config.save(&path)?;
        let config_ = ActorTrainerConfig::load(&path)?;
        assert_eq!(config, config_);
        Ok(())
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let mut trainer = ActorTrainer::build(
            reinforce_config(),
            ToyPolicy::new(),
            None,
            None,
            Device::Cpu,
        )?;
        let exp = crate::experience::tests::dummy_experience(4, 8);
        trainer.train_step(&exp, &exp)?;
        let trained_bias = trainer.policy().bias_value();
        assert!(trained_bias != 0.0);

        let dir = tempdir::TempDir::new("actor_trainer")?;
        trainer.save(dir.path())?;

        let mut restored = ActorTrainer::build(
            reinforce_config(),
            ToyPolicy::new(),
            None,
            None,
            Device::Cpu,
        )?;
        restored.load(dir.path())?;
        assert!((restored.policy().bias_value() - trained_bias).abs() < 1e-8);
        Ok(())
    }
}

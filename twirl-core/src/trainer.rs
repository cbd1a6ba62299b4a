//! Train a policy against a twisted target with paired experience streams.
mod config;
use crate::{
    error::TwirlError,
    kl_controller::KlController,
    record::{Record, RecordValue, RecordValue::Scalar},
    CheckpointWriter, DistributedStrategy, DualBatchAgent, ExperienceMaker, ReplayBufferBase,
};
use anyhow::Result;
use chrono::prelude::Local;
pub use config::TrainerConfig;
use log::info;

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Manages the dual-replay-buffer training loop.
///
/// # Training loop
///
/// Each outer iteration moves through four states:
///
/// 1. **Collecting**: for each incoming prompt batch, one experience is
///    drawn from the on-policy experience maker and one from the
///    negative-sampling (twisted-proposal) maker, and appended to the
///    respective replay buffer. When the configured loss does not
///    consume the negative stream, the on-policy experience is reused
///    for the second buffer instead of sampling twice.
/// 2. **Normalizing**: once `update_timesteps` rollouts have
///    accumulated, the configured per-sequence field is standardized
///    across each buffer with a cross-process mean and standard
///    deviation.
/// 3. **Training**: `max_epochs` passes over the zipped mini-batches of
///    the two buffers; each pair is handed to the agent for one
///    gradient step. The two buffers must yield the same number of
///    mini-batches; unequal lengths are a fatal configuration error.
/// 4. **Cleared**: both buffers are emptied, the adaptive KL controller
///    is updated from the measured KL statistic, and a checkpoint is
///    written when the step counter hits the save interval.
///
/// # Interaction of objects
///
/// ```mermaid
/// graph LR
///     P[Prompts]-->M1[ExperienceMaker on-policy]
///     P-->M2[ExperienceMaker negative]
///     M1-->B1[ReplayBuffer]
///     M2-->B2[ReplayBuffer neg]
///     B1-->|zipped mini-batches|A[DualBatchAgent]
///     B2-->|zipped mini-batches|A
///     A-->|Record|T[HarmlessnessTrainer]
/// ```
///
/// Within one process, mini-batches from the two buffers are consumed in
/// strict paired order so that on-policy and negative-sampling
/// statistics correspond to the same optimizer step. Across processes,
/// the only synchronization points are the collective reductions behind
/// [`DistributedStrategy`].
pub struct HarmlessnessTrainer<B, S, C>
where
    B: ReplayBufferBase,
    B::Item: Clone,
    S: DistributedStrategy,
    C: CheckpointWriter,
{
    config: TrainerConfig,

    /// Controller of the KL penalty coefficient, updated once per outer
    /// iteration from the measured KL statistic.
    kl_ctl: KlController,

    /// Buffer of the on-policy experience stream.
    replay_buffer: B,

    /// Buffer of the negative-sampling (twisted-proposal) stream.
    replay_buffer_neg: B,

    strategy: S,

    /// Checkpoint collaborator; `None` disables saving.
    checkpoint_writer: Option<C>,

    /// Counts outer iterations; drives the checkpoint cadence.
    total_steps: usize,

    /// Rollouts accumulated since the last optimization pass.
    rollouts_since_update: usize,
}

impl<B, S, C> HarmlessnessTrainer<B, S, C>
where
    B: ReplayBufferBase,
    B::Item: Clone,
    S: DistributedStrategy,
    C: CheckpointWriter,
{
    /// Constructs a trainer. Fails if the configuration requests a
    /// deferred feature or is internally inconsistent.
    pub fn build(
        config: TrainerConfig,
        replay_buffer: B,
        replay_buffer_neg: B,
        strategy: S,
        checkpoint_writer: Option<C>,
    ) -> Result<Self> {
        config.validate()?;
        let kl_ctl = KlController::new(config.init_kl_coef, config.kl_target, config.kl_horizon);
        Ok(Self {
            config,
            kl_ctl,
            replay_buffer,
            replay_buffer_neg,
            strategy,
            checkpoint_writer,
            total_steps: 0,
            rollouts_since_update: 0,
        })
    }

    /// Returns the current KL penalty coefficient.
    pub fn kl_coef(&self) -> f64 {
        self.kl_ctl.value()
    }

    /// Returns the number of outer iterations done so far.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Runs the training loop over the given prompt batches.
    ///
    /// Returns one status record per completed optimization pass (an
    /// optimization pass happens every `update_timesteps` rollouts).
    pub fn fit<A, M1, M2>(
        &mut self,
        agent: &mut A,
        experience_maker: &mut M1,
        experience_maker_neg: &mut M2,
        prompt_batches: &[Vec<String>],
    ) -> Result<Vec<Record>>
    where
        A: DualBatchAgent<Experience = B::Item>,
        M1: ExperienceMaker<Experience = B::Item>,
        M2: ExperienceMaker<Experience = B::Item>,
    {
        let mut statuses = Vec::new();
        for prompts in prompt_batches {
            if let Some(status) =
                self.training_iteration(agent, experience_maker, experience_maker_neg, prompts)?
            {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    /// Performs one outer iteration: collect a rollout from both
    /// streams and, when enough rollouts have accumulated, run an
    /// optimization pass.
    ///
    /// Returns `Some(status)` if an optimization pass was done.
    pub fn training_iteration<A, M1, M2>(
        &mut self,
        agent: &mut A,
        experience_maker: &mut M1,
        experience_maker_neg: &mut M2,
        prompts: &[String],
    ) -> Result<Option<Record>>
    where
        A: DualBatchAgent<Experience = B::Item>,
        M1: ExperienceMaker<Experience = B::Item>,
        M2: ExperienceMaker<Experience = B::Item>,
    {
        let experience =
            experience_maker.make_experience(prompts, self.config.samples_per_prompt)?;
        let experience_neg = if agent.needs_negative_stream() {
            experience_maker_neg.make_experience(prompts, self.config.samples_per_prompt)?
        } else {
            experience.clone()
        };
        self.replay_buffer.append(experience);
        self.replay_buffer_neg.append(experience_neg);
        self.total_steps += 1;
        self.rollouts_since_update += 1;

        if self.rollouts_since_update < self.config.update_timesteps {
            return Ok(None);
        }
        self.rollouts_since_update = 0;

        if let Some(key) = &self.config.normalize_field {
            self.replay_buffer.normalize(key, &self.strategy)?;
            self.replay_buffer_neg.normalize(key, &self.strategy)?;
        }

        let mut status = self.train(agent)?;
        status.insert("datetime", RecordValue::DateTime(Local::now()));

        self.replay_buffer.clear();
        self.replay_buffer_neg.clear();

        if let Ok(kl) = status.get_scalar("kl") {
            self.kl_ctl.update(kl, self.config.rollout_batch_size);
        }

        self.save_checkpoint_if_due()?;

        Ok(Some(status))
    }

    /// Runs `max_epochs` passes over the zipped mini-batches of the two
    /// buffers and returns the mean status.
    fn train<A>(&mut self, agent: &mut A) -> Result<Record>
    where
        A: DualBatchAgent<Experience = B::Item>,
    {
        let mut status_list = Vec::new();

        for epoch in 0..self.config.max_epochs {
            let batches = self.replay_buffer.minibatches()?;
            let batches_neg = self.replay_buffer_neg.minibatches()?;
            if batches.len() != batches_neg.len() {
                return Err(TwirlError::Config(format!(
                    "the two replay buffers must yield the same number of mini-batches, \
                     got {} and {}",
                    batches.len(),
                    batches_neg.len()
                ))
                .into());
            }
            info!(
                "train epoch {}/{}: {} paired mini-batches",
                epoch + 1,
                self.config.max_epochs,
                batches.len()
            );

            for (batch, batch_neg) in batches.iter().zip(batches_neg.iter()) {
                let mut status = agent.train_step(batch, batch_neg)?;
                self.all_reduce_kl(&mut status)?;
                status_list.push(status);
            }
        }

        Ok(Record::mean_scalars(status_list.iter()))
    }

    /// Response-length-weighted mean of the KL statistic across
    /// processes. This is a synchronous collective; every process must
    /// reach it.
    fn all_reduce_kl(&self, status: &mut Record) -> Result<()> {
        if let (Ok(kl), Ok(len)) = (
            status.get_scalar("kl"),
            status.get_scalar("response_length"),
        ) {
            let mut xs = [(kl * len) as f64, len as f64];
            self.strategy.all_reduce_sum(&mut xs)?;
            status.insert("kl", Scalar((xs[0] / xs[1].max(f64::EPSILON)) as f32));
        }
        Ok(())
    }

    fn save_checkpoint_if_due(&mut self) -> Result<()> {
        if self.config.save_interval > 0 && self.total_steps % self.config.save_interval == 0 {
            if let Some(writer) = self.checkpoint_writer.as_mut() {
                let tag = format!("total_step{}", self.total_steps);
                info!("saving checkpoint with tag {}", tag);
                writer.save_checkpoint(&tag)?;
            }
        }
        Ok(())
    }
}

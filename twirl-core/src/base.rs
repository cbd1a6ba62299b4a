//! Interfaces of the training core and its external collaborators.
use crate::{error::TwirlError, record::Record};
use anyhow::Result;

/// Generates one batch of experience from a batch of prompts.
///
/// This is the seam to the rollout/generation pipeline: the maker owns
/// the sampling policy, the reward model and whatever generation
/// machinery it needs. The returned experience must arrive with its
/// action mask already zeroed beyond generated content and its reward
/// statistics populated.
pub trait ExperienceMaker {
    /// The experience bundle produced per rollout.
    type Experience;

    /// Samples `samples_per_prompt` continuations for each prompt and
    /// scores them.
    fn make_experience(
        &mut self,
        prompts: &[String],
        samples_per_prompt: usize,
    ) -> Result<Self::Experience>;
}

/// Interface of buffers of experience.
pub trait ExperienceBufferBase {
    /// Items stored in the buffer.
    type Item;

    /// Returns the number of buffered items.
    fn len(&self) -> usize;

    /// Returns `true` if the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends an item. Insertion order is arrival order.
    fn append(&mut self, item: Self::Item);

    /// Discards all items.
    fn clear(&mut self);
}

/// Interface of replay buffers the trainer draws mini-batches from.
pub trait ReplayBufferBase: ExperienceBufferBase {
    /// Rescales the named per-sequence field in-place across all
    /// buffered items, using a cross-process mean and standard
    /// deviation obtained through `strategy`.
    fn normalize(&mut self, key: &str, strategy: &dyn DistributedStrategy)
        -> Result<(), TwirlError>;

    /// Splits the buffered experience into mini-batches of the
    /// configured micro-batch size. Trailing items that do not fill a
    /// complete mini-batch are dropped.
    fn minibatches(&self) -> Result<Vec<Self::Item>, TwirlError>;
}

/// An agent performing one optimization step from a pair of mini-batches.
///
/// The two batches come from two independently sampled streams: the
/// on-policy stream and the negative (twisted-proposal) stream. They are
/// consumed in strict zipped order so that the statistics of the two
/// streams correspond to the same optimizer step.
pub trait DualBatchAgent {
    /// The experience bundle consumed per step.
    type Experience;

    /// Returns `true` if the configured loss consumes the negative
    /// stream. When `false`, the trainer reuses the on-policy experience
    /// for the second slot instead of sampling a second stream.
    fn needs_negative_stream(&self) -> bool;

    /// Computes the actor loss on the paired mini-batches, applies one
    /// gradient step, and returns the step status.
    fn train_step(
        &mut self,
        experience: &Self::Experience,
        experience_neg: &Self::Experience,
    ) -> Result<Record>;
}

/// Cross-process reduction used for the KL statistic and for buffer
/// normalization.
///
/// The reduction is a synchronous collective: all participating
/// processes must reach it, or the run deadlocks. This is the only
/// blocking point in the core.
pub trait DistributedStrategy {
    /// Number of data-parallel processes.
    fn world_size(&self) -> usize;

    /// Sums each element of `xs` across all processes, in place.
    fn all_reduce_sum(&self, xs: &mut [f64]) -> Result<(), TwirlError>;
}

/// Single-process strategy; reductions are no-ops.
pub struct SingleProcess;

impl DistributedStrategy for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _xs: &mut [f64]) -> Result<(), TwirlError> {
        Ok(())
    }
}

/// Writes model checkpoints.
///
/// The writer is opaque to the core: it is invoked with a plain string
/// tag of the form `total_step<N>` and persists whatever it was
/// constructed around.
pub trait CheckpointWriter {
    /// Saves a checkpoint under the given tag.
    fn save_checkpoint(&mut self, tag: &str) -> Result<()>;
}

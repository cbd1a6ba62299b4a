//! Policy-gradient losses of the actor.
//!
//! All losses here consume grouped batches: per-token tensors have shape
//! `(num_prompts, samples_per_prompt, seq_len)` and per-sequence tensors
//! `(num_prompts, samples_per_prompt)`. Baselines and negative-stream
//! weights are computed within each prompt group.
use super::check_action_len;
use crate::{util::masked_mean, weights::BatchLayout};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};
use twirl_core::error::TwirlError;

const LAYOUT: BatchLayout = BatchLayout::GroupedByPrompt;

/// Baseline subtracted from the reward before the gradient step.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub enum Baseline {
    /// No baseline; the raw reward is the advantage.
    None,

    /// Mean reward of the samples of the same prompt.
    BatchMean,

    /// A fixed scalar.
    Hardcoded(f64),
}

impl Baseline {
    /// Advantage of each sequence, detached.
    fn advantage(&self, final_reward: &Tensor) -> Tensor {
        let adv = match self {
            Self::None => final_reward.shallow_clone(),
            Self::BatchMean => {
                final_reward
                    - final_reward.mean_dim(
                        Some([LAYOUT.sample_dim()].as_slice()),
                        true,
                        Kind::Float,
                    )
            }
            Self::Hardcoded(b) => final_reward - *b,
        };
        adv.detach()
    }
}

/// REINFORCE with a per-prompt baseline.
pub struct ReinforceLoss {
    baseline: Baseline,
}

impl ReinforceLoss {
    /// Constructs the loss.
    pub fn new(baseline: Baseline) -> Self {
        Self { baseline }
    }

    /// Computes the loss on a grouped batch.
    pub fn forward(
        &self,
        action_log_probs: &Tensor,
        final_reward: &Tensor,
        action_mask: &Tensor,
    ) -> Result<Tensor, TwirlError> {
        LAYOUT.check_per_token(action_log_probs, "action_log_probs")?;
        LAYOUT.check_per_sequence(final_reward, "final_reward")?;
        LAYOUT.check_per_token(action_mask, "action_mask")?;
        check_action_len(action_mask)?;

        let mask = action_mask.to_kind(Kind::Float);
        let advantage = self.baseline.advantage(final_reward);
        let per_sequence = &advantage * masked_mean(action_log_probs, &mask, -1);
        Ok(-per_sequence.mean(Kind::Float))
    }
}

/// Weighted sum of the negative-stream per-sequence log-probs within a
/// prompt group, averaged over prompts. Minimizing it pushes probability
/// mass away from the weighted negative samples.
fn negative_term(
    action_log_probs_neg: &Tensor,
    weight: &Tensor,
    mask_neg: &Tensor,
) -> Tensor {
    let per_sequence = weight * masked_mean(action_log_probs_neg, mask_neg, -1);
    per_sequence
        .sum_dim_intlist(Some([LAYOUT.sample_dim()].as_slice()), false, Kind::Float)
        .mean(Kind::Float)
}

/// REINFORCE on the on-policy stream plus unlearning of the
/// importance-weighted negative stream.
pub struct NegTrainingLoss {
    alpha: f64,
    positive: ReinforceLoss,
}

impl NegTrainingLoss {
    /// Constructs the loss; `alpha` weights the negative term.
    pub fn new(alpha: f64, baseline: Baseline) -> Self {
        Self {
            alpha,
            positive: ReinforceLoss::new(baseline),
        }
    }

    /// Computes the loss on a pair of grouped batches.
    ///
    /// `sigma_weights` are the normalized twisted-target weights of the
    /// negative stream, summing to one within each prompt group.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        action_log_probs: &Tensor,
        action_log_probs_neg: &Tensor,
        final_reward: &Tensor,
        sigma_weights: &Tensor,
        action_mask: &Tensor,
        action_mask_neg: &Tensor,
    ) -> Result<Tensor, TwirlError> {
        LAYOUT.check_per_token(action_log_probs_neg, "action_log_probs_neg")?;
        LAYOUT.check_per_sequence(sigma_weights, "sigma_weights")?;
        check_action_len(action_mask_neg)?;

        let positive = self
            .positive
            .forward(action_log_probs, final_reward, action_mask)?;
        let mask_neg = action_mask_neg.to_kind(Kind::Float);
        let negative = negative_term(action_log_probs_neg, &sigma_weights.detach(), &mask_neg);
        Ok((1.0 - self.alpha) * positive + self.alpha * negative)
    }
}

/// REINFORCE on both streams, with the negative stream additionally
/// importance-weighted toward the twisted target.
pub struct NegReinforceLoss {
    alpha: f64,
    positive: ReinforceLoss,
    baseline_neg: Baseline,
}

impl NegReinforceLoss {
    /// Constructs the loss; `alpha` weights the negative term.
    pub fn new(alpha: f64, baseline: Baseline, baseline_neg: Baseline) -> Self {
        Self {
            alpha,
            positive: ReinforceLoss::new(baseline),
            baseline_neg,
        }
    }

    /// Computes the loss on a pair of grouped batches.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        action_log_probs: &Tensor,
        action_log_probs_neg: &Tensor,
        final_reward: &Tensor,
        final_reward_neg: &Tensor,
        sigma_weights: &Tensor,
        action_mask: &Tensor,
        action_mask_neg: &Tensor,
    ) -> Result<Tensor, TwirlError> {
        LAYOUT.check_per_token(action_log_probs_neg, "action_log_probs_neg")?;
        LAYOUT.check_per_sequence(final_reward_neg, "final_reward_neg")?;
        LAYOUT.check_per_sequence(sigma_weights, "sigma_weights")?;
        check_action_len(action_mask_neg)?;

        let positive = self
            .positive
            .forward(action_log_probs, final_reward, action_mask)?;
        let mask_neg = action_mask_neg.to_kind(Kind::Float);
        let advantage_neg = self.baseline_neg.advantage(final_reward_neg);
        let weight = (sigma_weights * advantage_neg).detach();
        let negative = negative_term(action_log_probs_neg, &weight, &mask_neg);
        Ok((1.0 - self.alpha) * positive + self.alpha * negative)
    }
}

/// Selects and parameterizes the actor loss.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ActorLossConfig {
    /// Plain REINFORCE; the negative stream is unused.
    Reinforce {
        /// Baseline of the on-policy stream.
        baseline: Baseline,
    },

    /// REINFORCE plus unlearning of the weighted negative stream.
    NegTraining {
        /// Weight of the negative term, in `[0, 1]`.
        alpha: f64,
        /// Baseline of the on-policy stream.
        baseline: Baseline,
    },

    /// REINFORCE on both streams.
    NegReinforce {
        /// Weight of the negative term, in `[0, 1]`.
        alpha: f64,
        /// Baseline of the on-policy stream.
        baseline: Baseline,
        /// Baseline of the negative stream.
        baseline_neg: Baseline,
    },
}

impl ActorLossConfig {
    /// Builds the configured loss.
    pub fn build(&self) -> Result<ActorLoss, TwirlError> {
        let check_alpha = |alpha: f64| {
            if (0.0..=1.0).contains(&alpha) {
                Ok(())
            } else {
                Err(TwirlError::Config(format!(
                    "mixing coefficient must lie in [0, 1], got {}",
                    alpha
                )))
            }
        };
        Ok(match self {
            Self::Reinforce { baseline } => ActorLoss::Reinforce(ReinforceLoss::new(*baseline)),
            Self::NegTraining { alpha, baseline } => {
                check_alpha(*alpha)?;
                ActorLoss::NegTraining(NegTrainingLoss::new(*alpha, *baseline))
            }
            Self::NegReinforce {
                alpha,
                baseline,
                baseline_neg,
            } => {
                check_alpha(*alpha)?;
                ActorLoss::NegReinforce(NegReinforceLoss::new(*alpha, *baseline, *baseline_neg))
            }
        })
    }
}

/// A built actor loss.
pub enum ActorLoss {
    /// Plain REINFORCE.
    Reinforce(ReinforceLoss),
    /// REINFORCE plus unlearning of the weighted negative stream.
    NegTraining(NegTrainingLoss),
    /// REINFORCE on both streams.
    NegReinforce(NegReinforceLoss),
}

impl ActorLoss {
    /// Returns `true` if the loss consumes the negative stream.
    pub fn needs_negative_stream(&self) -> bool {
        !matches!(self, Self::Reinforce(_))
    }
}

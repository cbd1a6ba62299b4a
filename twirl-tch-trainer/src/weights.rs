//! Importance weights of sampled sequences under the twisted target.
//!
//! The target distribution is the base policy reweighted by the
//! exponentiated final reward; the proposal is the policy the sequences
//! were actually sampled from. All weights are self-normalized over a
//! batch of samples and detached, so they act as constants in any loss
//! built on top of them.
use serde::{Deserialize, Serialize};
use tch::{no_grad, Kind, Tensor};
use twirl_core::error::TwirlError;

/// How samples in a batch relate to their prompts.
///
/// The layout decides the normalization axis of the self-normalized
/// weights: flat batches normalize over the whole batch, grouped batches
/// over the samples of each prompt separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BatchLayout {
    /// Per-token tensors have shape `(batch, seq_len)`; all samples form
    /// one normalization group.
    Flat,

    /// Per-token tensors have shape `(num_prompts, samples_per_prompt,
    /// seq_len)`; each prompt is its own normalization group.
    GroupedByPrompt,
}

impl BatchLayout {
    /// Axis over which sample weights are normalized.
    pub fn sample_dim(self) -> i64 {
        match self {
            Self::Flat => 0,
            Self::GroupedByPrompt => 1,
        }
    }

    fn per_token_rank(self) -> usize {
        match self {
            Self::Flat => 2,
            Self::GroupedByPrompt => 3,
        }
    }

    /// Checks that a per-token tensor has the rank this layout implies.
    pub fn check_per_token(self, t: &Tensor, name: &str) -> Result<(), TwirlError> {
        let rank = t.size().len();
        if rank != self.per_token_rank() {
            return Err(TwirlError::Config(format!(
                "{} must have rank {} under layout {:?}, got rank {}",
                name,
                self.per_token_rank(),
                self,
                rank
            )));
        }
        Ok(())
    }

    /// Checks that a per-sequence tensor has the rank this layout
    /// implies (one less than per-token tensors).
    pub fn check_per_sequence(self, t: &Tensor, name: &str) -> Result<(), TwirlError> {
        let rank = t.size().len();
        if rank != self.per_token_rank() - 1 {
            return Err(TwirlError::Config(format!(
                "{} must have rank {} under layout {:?}, got rank {}",
                name,
                self.per_token_rank() - 1,
                self,
                rank
            )));
        }
        Ok(())
    }
}

/// Unnormalized log importance weights of whole sequences.
///
/// `log w = Σ log p0 + r − Σ log q`, summed over the token axis. The
/// result is detached.
pub fn positive_log_weights(
    base_action_log_probs: &Tensor,
    sampling_log_probs: &Tensor,
    final_reward: &Tensor,
) -> Tensor {
    no_grad(|| {
        let log_w = base_action_log_probs.sum_dim_intlist(Some([-1].as_slice()), false, Kind::Float)
            + final_reward
            - sampling_log_probs.sum_dim_intlist(Some([-1].as_slice()), false, Kind::Float);
        log_w.detach()
    })
}

/// Self-normalized importance weights of whole sequences.
///
/// Softmax of [`positive_log_weights`] over the sample axis of the
/// layout. Each normalization group sums to one.
pub fn normalized_positive_weights(
    base_action_log_probs: &Tensor,
    sampling_log_probs: &Tensor,
    final_reward: &Tensor,
    layout: BatchLayout,
) -> Result<Tensor, TwirlError> {
    layout.check_per_token(base_action_log_probs, "base_action_log_probs")?;
    layout.check_per_token(sampling_log_probs, "sampling_log_probs")?;
    layout.check_per_sequence(final_reward, "final_reward")?;
    Ok(no_grad(|| {
        positive_log_weights(base_action_log_probs, sampling_log_probs, final_reward)
            .softmax(layout.sample_dim(), Kind::Float)
            .detach()
    }))
}

/// Per-prefix log weights under the twist plus normalized sequence
/// weights.
///
/// The first element holds, at token position `t`, the log weight of the
/// prefix ending there under the twisted proposal target:
/// `cumsum(log p0)[t] + log ψ[t] − cumsum(log q)[t]`. The second is
/// [`normalized_positive_weights`] of the full sequences. Both are
/// detached.
pub fn positive_and_negative_weights(
    base_action_log_probs: &Tensor,
    sampling_log_probs: &Tensor,
    final_reward: &Tensor,
    log_twist: &Tensor,
    layout: BatchLayout,
) -> Result<(Tensor, Tensor), TwirlError> {
    layout.check_per_token(log_twist, "log_twist")?;
    let w_sigma = normalized_positive_weights(
        base_action_log_probs,
        sampling_log_probs,
        final_reward,
        layout,
    )?;
    let log_w_pi = no_grad(|| {
        (base_action_log_probs.cumsum(-1, Kind::Float) + log_twist
            - sampling_log_probs.cumsum(-1, Kind::Float))
        .detach()
    });
    Ok((log_w_pi, w_sigma))
}

/// Token-by-token formulation of [`positive_and_negative_weights`].
///
/// Accumulates the per-prefix log weight one generated token at a time,
/// as an online sampler would. The telescoped sum is identical to the
/// closed form up to floating-point rounding. Each step's accumulator is
/// copied before being stored so that stored prefixes never alias the
/// running state.
pub fn positive_and_negative_weights_incremental(
    base_action_log_probs: &Tensor,
    sampling_log_probs: &Tensor,
    final_reward: &Tensor,
    log_twist: &Tensor,
    layout: BatchLayout,
) -> Result<(Tensor, Tensor), TwirlError> {
    layout.check_per_token(base_action_log_probs, "base_action_log_probs")?;
    layout.check_per_token(sampling_log_probs, "sampling_log_probs")?;
    layout.check_per_token(log_twist, "log_twist")?;
    layout.check_per_sequence(final_reward, "final_reward")?;

    let size = base_action_log_probs.size();
    let num_tokens = size[size.len() - 1];
    if num_tokens == 0 {
        return Err(TwirlError::Config(
            "cannot accumulate weights over zero generated tokens".into(),
        ));
    }

    Ok(no_grad(|| {
        let base_cumsum = base_action_log_probs.cumsum(-1, Kind::Float);
        // log p0(prefix) + log psi(prefix), per position.
        let log_p_psi = &base_cumsum + log_twist;

        let mut log_w = sampling_log_probs.select(-1, 0).zeros_like();
        let mut prefixes: Vec<Tensor> = Vec::with_capacity(num_tokens as usize);
        let mut positive_total = log_w.copy();

        for i in 0..num_tokens {
            let prev_psi = if i == 0 {
                log_w.zeros_like()
            } else {
                log_p_psi.select(-1, i - 1)
            };
            let increment = log_p_psi.select(-1, i) - sampling_log_probs.select(-1, i) - &prev_psi;
            if i == num_tokens - 1 {
                // The twist at the final position is replaced by the
                // final reward.
                positive_total = &log_w + base_cumsum.select(-1, i) + final_reward
                    - sampling_log_probs.select(-1, i)
                    - &prev_psi;
            }
            log_w = &log_w + increment;
            prefixes.push(log_w.detach().copy());
        }

        let log_w_pi = Tensor::stack(&prefixes, -1).detach();
        let w_sigma = positive_total
            .softmax(layout.sample_dim(), Kind::Float)
            .detach();
        (log_w_pi, w_sigma)
    }))
}

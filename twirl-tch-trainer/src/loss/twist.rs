//! Losses fitting a twist (value) function to the twisted target.
use super::check_action_len;
use crate::{
    util::masked_mean,
    weights::{self, BatchLayout},
};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};
use twirl_core::error::TwirlError;

/// Inputs of one twist-loss evaluation.
///
/// `values` is the log twist `log ψ` evaluated on the sampled tokens.
/// Fields past `base_action_log_probs` are only consumed by some of the
/// losses; a loss that needs an absent field fails with a configuration
/// error.
pub struct TwistInputs<'a> {
    /// Log twist on the sampled tokens, per-token.
    pub values: &'a Tensor,

    /// Final reward of each sequence.
    pub final_reward: &'a Tensor,

    /// Mask over the generated-token suffix.
    pub action_mask: &'a Tensor,

    /// Per-token log-probs under the sampling policy (the proposal).
    pub sampling_log_probs: &'a Tensor,

    /// Per-token log-probs under the base policy.
    pub base_action_log_probs: &'a Tensor,

    /// Twist values of a previous iterate, for clipped value regression.
    pub old_values: Option<&'a Tensor>,

    /// Regression targets, for value regression.
    pub returns: Option<&'a Tensor>,

    /// Log twist evaluated on sequences drawn from the base policy, for
    /// the exact SIXO negative term.
    pub values_on_base_samples: Option<&'a Tensor>,

    /// Log twist over the whole vocabulary at every position, for DPG.
    pub log_twist_all_vocab: Option<&'a Tensor>,

    /// Base-policy log-probs over the whole vocabulary at every
    /// position, for DPG.
    pub base_log_probs_all_vocab: Option<&'a Tensor>,
}

fn required<'a>(t: Option<&'a Tensor>, name: &str) -> Result<&'a Tensor, TwirlError> {
    t.ok_or_else(|| TwirlError::Config(format!("{} is required by the configured loss", name)))
}

/// Contrastive twist learning loss.
///
/// The positive term pulls `log ψ` up on sequences weighted by the
/// twisted-target weights; the negative term pushes it down under the
/// per-prefix proposal weights. With `no_second_term` only the positive
/// term remains.
pub struct CtlLoss {
    layout: BatchLayout,
    no_second_term: bool,
}

impl CtlLoss {
    /// Constructs the loss.
    pub fn new(layout: BatchLayout, no_second_term: bool) -> Self {
        Self {
            layout,
            no_second_term,
        }
    }

    /// Computes the loss. Gradients flow only through `inputs.values`.
    pub fn forward(&self, inputs: &TwistInputs) -> Result<Tensor, TwirlError> {
        self.layout.check_per_token(inputs.values, "values")?;
        self.layout.check_per_token(inputs.action_mask, "action_mask")?;
        check_action_len(inputs.action_mask)?;

        let mask = inputs.action_mask.to_kind(Kind::Float);
        let values = inputs.values * &mask;
        let base = inputs.base_action_log_probs * &mask;

        let (log_w_pi, w_sigma) = weights::positive_and_negative_weights(
            &base,
            inputs.sampling_log_probs,
            inputs.final_reward,
            &values,
            self.layout,
        )?;

        let positive = w_sigma.unsqueeze(-1) * &values;
        let loss = if self.no_second_term {
            -positive
        } else {
            let w_pi = log_w_pi.softmax(self.layout.sample_dim(), Kind::Float);
            let negative = w_pi * &values;
            -(positive - negative)
        };

        Ok(masked_mean(&loss, &mask, -1).sum(Kind::Float))
    }
}

/// SIXO classification loss.
///
/// Trains `sigmoid(log ψ)` to separate twisted-target sequences from
/// base-policy sequences. The negative term either reweights the
/// sampled batch toward the base policy (`approx_neg`) or uses a
/// separate batch actually drawn from the base policy.
pub struct SixoLoss {
    layout: BatchLayout,
    approx_neg: bool,
}

impl SixoLoss {
    /// Constructs the loss.
    pub fn new(layout: BatchLayout, approx_neg: bool) -> Self {
        Self { layout, approx_neg }
    }

    /// Computes the loss. Gradients flow only through `inputs.values`
    /// and `inputs.values_on_base_samples`.
    pub fn forward(&self, inputs: &TwistInputs) -> Result<Tensor, TwirlError> {
        self.layout.check_per_token(inputs.values, "values")?;
        self.layout.check_per_token(inputs.action_mask, "action_mask")?;
        check_action_len(inputs.action_mask)?;
        if self.approx_neg && inputs.values_on_base_samples.is_some() {
            return Err(TwirlError::Config(
                "approx_neg and values_on_base_samples are mutually exclusive".into(),
            ));
        }

        let mask = inputs.action_mask.to_kind(Kind::Float);
        let values = inputs.values * &mask;
        let base = inputs.base_action_log_probs * &mask;

        let w_sigma = weights::normalized_positive_weights(
            &base,
            inputs.sampling_log_probs,
            inputs.final_reward,
            self.layout,
        )?;
        let positive = w_sigma.unsqueeze(-1) * values.log_sigmoid();

        let negative = if self.approx_neg {
            // Reweight the sampled batch toward the plain base policy
            // (no reward in the exponent).
            let log_w_p = (base.sum_dim_intlist(Some([-1].as_slice()), false, Kind::Float)
                - inputs.sampling_log_probs.sum_dim_intlist(
                    Some([-1].as_slice()),
                    false,
                    Kind::Float,
                ))
            .detach();
            let w_p = log_w_p.softmax(self.layout.sample_dim(), Kind::Float);
            // log(1 - sigmoid(x)) = logsigmoid(-x)
            w_p.unsqueeze(-1) * (-&values).log_sigmoid()
        } else {
            let on_base = required(inputs.values_on_base_samples, "values_on_base_samples")?;
            self.layout.check_per_token(on_base, "values_on_base_samples")?;
            let n = on_base.size()[self.layout.sample_dim() as usize];
            (-on_base).log_sigmoid() / n as f64
        };

        let loss = -(positive + negative);
        Ok(masked_mean(&loss, &mask, -1).sum(Kind::Float))
    }
}

/// Distributional policy gradient twist loss.
///
/// The negative term integrates `log ψ` over the full vocabulary under
/// the normalized `p0 · ψ` distribution at every position, instead of
/// relying on sampled tokens only.
pub struct DpgLoss {
    layout: BatchLayout,
}

impl DpgLoss {
    /// Constructs the loss.
    pub fn new(layout: BatchLayout) -> Self {
        Self { layout }
    }

    /// Computes the loss. Gradients flow only through `inputs.values`
    /// and `inputs.log_twist_all_vocab`.
    pub fn forward(&self, inputs: &TwistInputs) -> Result<Tensor, TwirlError> {
        self.layout.check_per_token(inputs.values, "values")?;
        self.layout.check_per_token(inputs.action_mask, "action_mask")?;
        check_action_len(inputs.action_mask)?;

        let log_twist_all = required(inputs.log_twist_all_vocab, "log_twist_all_vocab")?;
        let base_all = required(inputs.base_log_probs_all_vocab, "base_log_probs_all_vocab")?;
        let expected_rank = inputs.values.size().len() + 1;
        if log_twist_all.size().len() != expected_rank || base_all.size().len() != expected_rank {
            return Err(TwirlError::Config(format!(
                "all-vocab tensors must have rank {} under layout {:?}",
                expected_rank, self.layout
            )));
        }

        let mask = inputs.action_mask.to_kind(Kind::Float);
        let values = inputs.values * &mask;
        let base = inputs.base_action_log_probs * &mask;

        let w_sigma = weights::normalized_positive_weights(
            &base,
            inputs.sampling_log_probs,
            inputs.final_reward,
            self.layout,
        )?;

        let positive = values;
        let normalized_p_psi = (base_all + log_twist_all).softmax(-1, Kind::Float).detach();
        let negative = (normalized_p_psi * log_twist_all).sum_dim_intlist(
            Some([-1].as_slice()),
            false,
            Kind::Float,
        );

        let loss = -(w_sigma.unsqueeze(-1) * (positive - negative));
        Ok(masked_mean(&loss, &mask, -1).sum(Kind::Float))
    }
}

/// Clipped value-regression loss.
pub struct ValueLoss {
    clip_eps: Option<f64>,
}

impl ValueLoss {
    /// Constructs the loss; `clip_eps` enables PPO-style clipping
    /// against the previous value iterate.
    pub fn new(clip_eps: Option<f64>) -> Self {
        Self { clip_eps }
    }

    /// Computes `0.5 * masked MSE` between values and returns.
    pub fn forward(
        &self,
        values: &Tensor,
        old_values: &Tensor,
        returns: &Tensor,
        action_mask: &Tensor,
    ) -> Result<Tensor, TwirlError> {
        check_action_len(action_mask)?;
        let mask = action_mask.to_kind(Kind::Float);

        let loss = match self.clip_eps {
            Some(eps) => {
                let values_clipped = old_values + (values - old_values).clamp(-eps, eps);
                let surr1 = (values_clipped - returns).pow_tensor_scalar(2.0);
                let surr2 = (values - returns).pow_tensor_scalar(2.0);
                surr1.maximum(&surr2)
            }
            None => (values - returns).pow_tensor_scalar(2.0),
        };

        Ok(0.5 * masked_mean(&loss, &mask, -1).mean(Kind::Float))
    }
}

/// Convex combination of [`CtlLoss`] and [`ValueLoss`].
pub struct MixedCtlValueLoss {
    ctl: CtlLoss,
    value: ValueLoss,
    alpha: f64,
}

impl MixedCtlValueLoss {
    /// Constructs the loss; `alpha` weights the CTL term and must lie in
    /// `[0, 1]`.
    pub fn new(layout: BatchLayout, alpha: f64, clip_eps: Option<f64>) -> Result<Self, TwirlError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(TwirlError::Config(format!(
                "mixing coefficient must lie in [0, 1], got {}",
                alpha
            )));
        }
        Ok(Self {
            ctl: CtlLoss::new(layout, false),
            value: ValueLoss::new(clip_eps),
            alpha,
        })
    }

    /// Computes `alpha * ctl + (1 - alpha) * value`.
    pub fn forward(&self, inputs: &TwistInputs) -> Result<Tensor, TwirlError> {
        let old_values = required(inputs.old_values, "old_values")?;
        let returns = required(inputs.returns, "returns")?;
        let ctl = self.ctl.forward(inputs)?;
        let value = self
            .value
            .forward(inputs.values, old_values, returns, inputs.action_mask)?;
        Ok(self.alpha * ctl + (1.0 - self.alpha) * value)
    }
}

/// Selects and parameterizes a twist loss.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum TwistLossConfig {
    /// Contrastive twist learning.
    Ctl {
        /// Drop the negative term.
        no_second_term: bool,
    },

    /// SIXO classification loss.
    Sixo {
        /// Approximate the negative term by reweighting the sampled
        /// batch instead of using base-policy samples.
        approx_neg: bool,
    },

    /// Distributional policy gradient loss.
    Dpg,

    /// Mixture of CTL and clipped value regression.
    MixedCtlValue {
        /// Weight of the CTL term, in `[0, 1]`.
        alpha: f64,
        /// Clipping range of the value term.
        clip_eps: Option<f64>,
    },
}

impl TwistLossConfig {
    /// Builds the configured loss for the given batch layout.
    pub fn build(&self, layout: BatchLayout) -> Result<TwistLoss, TwirlError> {
        Ok(match self {
            Self::Ctl { no_second_term } => TwistLoss::Ctl(CtlLoss::new(layout, *no_second_term)),
            Self::Sixo { approx_neg } => TwistLoss::Sixo(SixoLoss::new(layout, *approx_neg)),
            Self::Dpg => TwistLoss::Dpg(DpgLoss::new(layout)),
            Self::MixedCtlValue { alpha, clip_eps } => {
                TwistLoss::MixedCtlValue(MixedCtlValueLoss::new(layout, *alpha, *clip_eps)?)
            }
        })
    }
}

/// A built twist loss.
pub enum TwistLoss {
    /// Contrastive twist learning.
    Ctl(CtlLoss),
    /// SIXO classification loss.
    Sixo(SixoLoss),
    /// Distributional policy gradient loss.
    Dpg(DpgLoss),
    /// Mixture of CTL and clipped value regression.
    MixedCtlValue(MixedCtlValueLoss),
}

impl TwistLoss {
    /// Computes the loss on the given inputs.
    pub fn forward(&self, inputs: &TwistInputs) -> Result<Tensor, TwirlError> {
        match self {
            Self::Ctl(l) => l.forward(inputs),
            Self::Sixo(l) => l.forward(inputs),
            Self::Dpg(l) => l.forward(inputs),
            Self::MixedCtlValue(l) => l.forward(inputs),
        }
    }
}

//! Loss functions of twisted-target training.
//!
//! [`twist`] holds the losses that fit a twist (value) function to the
//! twisted target; [`policy`] holds the policy-gradient losses of the
//! actor. Both operate on pre-masked per-token tensors and re-apply the
//! action mask to everything they sum over.
use tch::Tensor;
use twirl_core::error::TwirlError;

mod policy;
mod twist;

pub use policy::{
    ActorLoss, ActorLossConfig, Baseline, NegReinforceLoss, NegTrainingLoss, ReinforceLoss,
};
pub use twist::{
    CtlLoss, DpgLoss, MixedCtlValueLoss, SixoLoss, TwistInputs, TwistLoss, TwistLossConfig,
    ValueLoss,
};

/// Maximum verified length of the generated (action) part of a batch.
///
/// The interaction between right padding, EOS truncation and
/// reweighting is unverified beyond this length.
pub const MAX_ACTION_LEN: i64 = 100;

pub(crate) fn check_action_len(action_mask: &Tensor) -> Result<(), TwirlError> {
    let size = action_mask.size();
    let len = size[size.len() - 1];
    if len > MAX_ACTION_LEN {
        return Err(TwirlError::SequenceTooLong {
            len,
            max: MAX_ACTION_LEN,
        });
    }
    Ok(())
}

//! Tch-backed implementation of twisted-target harmlessness training.
//!
//! This crate provides the tensor-level pieces behind the traits of
//! [`twirl_core`]: the [`experience`] container, the
//! [`replay_buffer`](replay_buffer::TwistReplayBuffer), the importance
//! [`weights`] of the twisted target, the twist and policy-gradient
//! [`loss`] functions, and the [`ActorTrainer`] that performs the
//! per-mini-batch optimization step.
//!
//! Model inference and sequence generation stay outside: users plug in
//! their own [`PolicyModel`] and experience makers.
mod actor;
pub mod experience;
pub mod loss;
pub mod opt;
pub mod replay_buffer;
pub mod util;
pub mod weights;

pub use actor::{ActorTrainer, ActorTrainerConfig, ModelBase, PolicyModel};

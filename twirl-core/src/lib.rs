#![warn(missing_docs)]
//! Backend-free core of the twirl library.
//!
//! This crate defines the pieces of twisted-target harmlessness training
//! that do not depend on a tensor backend: status records, the error
//! taxonomy, the collaborator traits (experience makers, replay buffers,
//! agents, distributed strategy, checkpoint writers), KL-coefficient
//! controllers, and the dual-replay-buffer training loop.
//!
//! Tensor-backed implementations live in the `twirl-tch-trainer` crate.
pub mod error;
pub mod kl_controller;
pub mod record;

mod base;
pub use base::{
    CheckpointWriter, DistributedStrategy, DualBatchAgent, ExperienceBufferBase, ExperienceMaker,
    ReplayBufferBase, SingleProcess,
};

mod trainer;
pub use trainer::{HarmlessnessTrainer, TrainerConfig};

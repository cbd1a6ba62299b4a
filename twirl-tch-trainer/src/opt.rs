//! Optimizers.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{
    nn::{Adam, AdamW, Optimizer as Optimizer_, OptimizerConfig as OptimizerConfig_, VarStore},
    Tensor,
};

/// Configuration of optimizer for training neural networks.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum OptimizerConfig {
    /// Adam optimizer.
    Adam {
        /// Learning rate.
        lr: f64,
    },

    /// AdamW optimizer.
    AdamW {
        /// Learning rate.
        lr: f64,
        /// First moment decay.
        beta1: f64,
        /// Second moment decay.
        beta2: f64,
        /// Weight decay.
        wd: f64,
        /// Term added to the denominator.
        eps: f64,
        /// Whether to use the AMSGrad variant.
        amsgrad: bool,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam { lr: 1e-6 }
    }
}

impl OptimizerConfig {
    /// Constructs an optimizer.
    pub fn build(&self, vs: &VarStore) -> Result<Optimizer> {
        match &self {
            Self::Adam { lr } => {
                let opt = Adam::default().build(vs, *lr)?;
                Ok(Optimizer { opt, lr: *lr })
            }
            Self::AdamW {
                lr,
                beta1,
                beta2,
                wd,
                eps,
                amsgrad,
            } => {
                let opt = AdamW {
                    beta1: *beta1,
                    beta2: *beta2,
                    wd: *wd,
                    eps: *eps,
                    amsgrad: *amsgrad,
                }
                .build(vs, *lr)?;
                Ok(Optimizer { opt, lr: *lr })
            }
        }
    }
}

/// Optimizer wrapping [`tch::nn::Optimizer`].
pub struct Optimizer {
    opt: Optimizer_,
    lr: f64,
}

impl Optimizer {
    /// Applies a backward step.
    pub fn backward_step(&mut self, loss: &Tensor) {
        self.opt.backward_step(loss);
    }

    /// Zeros gradients.
    pub fn zero_grad(&mut self) {
        self.opt.zero_grad();
    }

    /// Returns the current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Overrides the learning rate, e.g. from an external scheduler.
    pub fn set_lr(&mut self, lr: f64) {
        self.opt.set_lr(lr);
        self.lr = lr;
    }
}

//! Utilities.
use crate::actor::ModelBase;
use log::trace;
use tch::{no_grad, Kind, Tensor};

/// Mean of `x` over dimension `dim`, counting only positions where
/// `mask` is non-zero.
pub fn masked_mean(x: &Tensor, mask: &Tensor, dim: i64) -> Tensor {
    let num = (x * mask).sum_dim_intlist(Some([dim].as_slice()), false, Kind::Float);
    let den = mask
        .sum_dim_intlist(Some([dim].as_slice()), false, Kind::Float)
        .clamp_min(1e-8);
    num / den
}

/// Apply soft update on variables.
///
/// Variables are identified by their names.
pub fn track<M: ModelBase>(dest: &mut M, src: &mut M, tau: f64) {
    let src = &mut src.get_var_store_mut().variables();
    let dest = &mut dest.get_var_store_mut().variables();
    debug_assert_eq!(src.len(), dest.len());

    no_grad(|| {
        for (name, src) in src.iter() {
            let dest = dest.get_mut(name).unwrap();
            dest.copy_(&(tau * src + (1.0 - tau) * &*dest));
        }
    });
    trace!("soft update");
}

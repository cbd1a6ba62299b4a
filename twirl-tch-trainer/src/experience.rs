//! Experience sampled from a policy, as consumed by the training core.
use tch::{Device, Tensor};
use twirl_core::error::TwirlError;

/// Per-sequence scalar statistics attached to an [`Experience`].
///
/// Every tensor has shape `(batch,)`.
#[derive(Debug)]
pub struct ExperienceInfo {
    /// Reward of each sequence, possibly KL-penalized ("return").
    pub reward: Tensor,

    /// Reward before any transform, for operator-facing logging.
    pub untransformed_reward: Tensor,

    /// Per-sequence KL estimate between the sampling policy and the
    /// base policy.
    pub kl: Tensor,

    /// Number of generated tokens per sequence.
    pub response_length: Tensor,

    /// Total sequence length (prompt plus generated tokens).
    pub total_length: Tensor,
}

impl ExperienceInfo {
    /// Returns the named field, if it exists.
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        match key {
            "reward" => Some(&self.reward),
            "untransformed_reward" => Some(&self.untransformed_reward),
            "kl" => Some(&self.kl),
            "response_length" => Some(&self.response_length),
            "total_length" => Some(&self.total_length),
            _ => None,
        }
    }

    /// Returns the named field mutably, if it exists.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Tensor> {
        match key {
            "reward" => Some(&mut self.reward),
            "untransformed_reward" => Some(&mut self.untransformed_reward),
            "kl" => Some(&mut self.kl),
            "response_length" => Some(&mut self.response_length),
            "total_length" => Some(&mut self.total_length),
            _ => None,
        }
    }

    fn to_device(&self, device: Device) -> Self {
        Self {
            reward: self.reward.to_device(device),
            untransformed_reward: self.untransformed_reward.to_device(device),
            kl: self.kl.to_device(device),
            response_length: self.response_length.to_device(device),
            total_length: self.total_length.to_device(device),
        }
    }
}

impl Clone for ExperienceInfo {
    fn clone(&self) -> Self {
        Self {
            reward: self.reward.copy(),
            untransformed_reward: self.untransformed_reward.copy(),
            kl: self.kl.copy(),
            response_length: self.response_length.copy(),
            total_length: self.total_length.copy(),
        }
    }
}

/// One batch of sampled sequences with masks, log-probs and statistics.
///
/// Produced by an experience maker and owned by exactly one replay
/// buffer slot until the buffer is cleared.
///
/// Invariant: `action_mask` and `action_log_probs` arrive pre-zeroed
/// outside the valid token range. Loss functions re-apply the mask to
/// the tensors they add up, and must not assume zero-padding of any
/// other input.
#[derive(Debug)]
pub struct Experience {
    /// Token ids, `(batch, total_len)`, prompt plus generated
    /// continuation, right-padded.
    pub sequences: Tensor,

    /// Mask over `sequences`; zero at padding.
    pub attention_mask: Tensor,

    /// Mask over the generated-token suffix, `(batch, num_actions)`;
    /// zero at padding and post-terminal tokens.
    pub action_mask: Tensor,

    /// Log-probability of each generated token under the sampling
    /// policy (the proposal), `(batch, num_actions)`.
    pub action_log_probs: Tensor,

    /// Per-sequence statistics.
    pub info: ExperienceInfo,
}

impl Clone for Experience {
    fn clone(&self) -> Self {
        Self {
            sequences: self.sequences.copy(),
            attention_mask: self.attention_mask.copy(),
            action_mask: self.action_mask.copy(),
            action_log_probs: self.action_log_probs.copy(),
            info: self.info.clone(),
        }
    }
}

impl Experience {
    /// Number of sequences in the batch.
    pub fn batch_size(&self) -> i64 {
        self.sequences.size()[0]
    }

    /// Number of generated tokens per sequence.
    pub fn num_actions(&self) -> i64 {
        let size = self.action_mask.size();
        size[size.len() - 1]
    }

    /// Moves all tensors to the given device.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            sequences: self.sequences.to_device(device),
            attention_mask: self.attention_mask.to_device(device),
            action_mask: self.action_mask.to_device(device),
            action_log_probs: self.action_log_probs.to_device(device),
            info: self.info.to_device(device),
        }
    }

    /// Concatenates experiences along the batch dimension.
    pub fn cat(items: &[Experience]) -> Result<Experience, TwirlError> {
        if items.is_empty() {
            return Err(TwirlError::Config(
                "cannot concatenate an empty list of experiences".into(),
            ));
        }
        let num_actions = items[0].num_actions();
        if items.iter().any(|e| e.num_actions() != num_actions) {
            return Err(TwirlError::Config(
                "experiences with different action lengths cannot be batched together".into(),
            ));
        }

        let cat = |f: fn(&Experience) -> &Tensor| {
            let ts = items.iter().map(f).collect::<Vec<_>>();
            Tensor::cat(&ts, 0)
        };

        Ok(Experience {
            sequences: cat(|e| &e.sequences),
            attention_mask: cat(|e| &e.attention_mask),
            action_mask: cat(|e| &e.action_mask),
            action_log_probs: cat(|e| &e.action_log_probs),
            info: ExperienceInfo {
                reward: cat(|e| &e.info.reward),
                untransformed_reward: cat(|e| &e.info.untransformed_reward),
                kl: cat(|e| &e.info.kl),
                response_length: cat(|e| &e.info.response_length),
                total_length: cat(|e| &e.info.total_length),
            },
        })
    }

    /// Splits the batch into chunks of `chunk_size` sequences.
    /// A trailing chunk smaller than `chunk_size` is dropped.
    pub fn split(&self, chunk_size: i64) -> Vec<Experience> {
        let split = |t: &Tensor| t.split(chunk_size, 0);

        let sequences = split(&self.sequences);
        let attention_mask = split(&self.attention_mask);
        let action_mask = split(&self.action_mask);
        let action_log_probs = split(&self.action_log_probs);
        let reward = split(&self.info.reward);
        let untransformed_reward = split(&self.info.untransformed_reward);
        let kl = split(&self.info.kl);
        let response_length = split(&self.info.response_length);
        let total_length = split(&self.info.total_length);

        let n_full = (self.batch_size() / chunk_size) as usize;

        (0..n_full)
            .map(|i| Experience {
                sequences: sequences[i].copy(),
                attention_mask: attention_mask[i].copy(),
                action_mask: action_mask[i].copy(),
                action_log_probs: action_log_probs[i].copy(),
                info: ExperienceInfo {
                    reward: reward[i].copy(),
                    untransformed_reward: untransformed_reward[i].copy(),
                    kl: kl[i].copy(),
                    response_length: response_length[i].copy(),
                    total_length: total_length[i].copy(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::convert::TryFrom;
    use tch::Kind;

    pub(crate) fn dummy_experience(batch_size: i64, num_actions: i64) -> Experience {
        let total_len = num_actions + 2;
        Experience {
            sequences: Tensor::zeros(&[batch_size, total_len], (Kind::Int64, Device::Cpu)),
            attention_mask: Tensor::ones(&[batch_size, total_len], tch::kind::FLOAT_CPU),
            action_mask: Tensor::ones(&[batch_size, num_actions], tch::kind::FLOAT_CPU),
            action_log_probs: Tensor::rand(&[batch_size, num_actions], tch::kind::FLOAT_CPU) - 1.0,
            info: ExperienceInfo {
                reward: Tensor::rand(&[batch_size], tch::kind::FLOAT_CPU),
                untransformed_reward: Tensor::rand(&[batch_size], tch::kind::FLOAT_CPU),
                kl: Tensor::rand(&[batch_size], tch::kind::FLOAT_CPU),
                response_length: Tensor::ones(&[batch_size], tch::kind::FLOAT_CPU)
                    * num_actions as f64,
                total_length: Tensor::ones(&[batch_size], tch::kind::FLOAT_CPU)
                    * total_len as f64,
            },
        }
    }

    #[test]
    fn test_cat_then_split_round_trip() {
        let a = dummy_experience(4, 8);
        let b = dummy_experience(4, 8);
        let cat = Experience::cat(&[a.clone(), b]).unwrap();
        assert_eq!(cat.batch_size(), 8);

        let chunks = cat.split(4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].batch_size(), 4);
        let diff = f64::try_from((&chunks[0].sequences - &a.sequences).abs().sum(Kind::Float)).unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_split_drops_partial_chunk() {
        let e = dummy_experience(10, 8);
        let chunks = e.split(4);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_cat_rejects_mismatched_action_lengths() {
        let a = dummy_experience(4, 8);
        let b = dummy_experience(4, 6);
        assert!(Experience::cat(&[a, b]).is_err());
    }

    #[test]
    fn test_info_field_lookup() {
        let mut e = dummy_experience(2, 4);
        assert!(e.info.get("reward").is_some());
        assert!(e.info.get_mut("kl").is_some());
        assert!(e.info.get("advantage").is_none());
    }
}

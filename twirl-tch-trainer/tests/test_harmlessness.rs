//! End-to-end test of the dual-replay-buffer training loop with toy
//! collaborators.
use anyhow::Result;
use std::{cell::RefCell, convert::TryFrom, path::Path, rc::Rc};
use tch::{nn, nn::VarStore, Device, Tensor};
use twirl_core::{
    record::RecordValue, CheckpointWriter, ExperienceMaker, HarmlessnessTrainer, SingleProcess,
    TrainerConfig,
};
use twirl_tch_trainer::{
    experience::{Experience, ExperienceInfo},
    loss::{ActorLossConfig, Baseline},
    opt::OptimizerConfig,
    replay_buffer::{TwistReplayBuffer, TwistReplayBufferConfig},
    ActorTrainer, ActorTrainerConfig, ModelBase, PolicyModel,
};

const NUM_ACTIONS: i64 = 6;
const SAMPLES_PER_PROMPT: usize = 2;

struct ToyPolicy {
    vs: VarStore,
    bias: Tensor,
}

impl ToyPolicy {
    fn new() -> Self {
        let vs = VarStore::new(Device::Cpu);
        let bias = vs.root().var("bias", &[1], nn::Init::Const(0.0));
        Self { vs, bias }
    }

    fn bias_value(&self) -> f64 {
        f64::try_from(&self.bias).unwrap()
    }
}

impl ModelBase for ToyPolicy {
    fn get_var_store(&self) -> &VarStore {
        &self.vs
    }

    fn get_var_store_mut(&mut self) -> &mut VarStore {
        &mut self.vs
    }

    fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.vs.load(path)?;
        Ok(())
    }
}

impl PolicyModel for ToyPolicy {
    fn action_log_probs(
        &self,
        sequences: &Tensor,
        num_actions: i64,
        _attention_mask: &Tensor,
    ) -> Tensor {
        let batch_size = sequences.size()[0];
        Tensor::ones(&[batch_size, num_actions], tch::kind::FLOAT_CPU) * -1.0 + &self.bias
    }
}

/// Produces fixed-shape experience; the reward is drawn uniformly from
/// `[0, 1)` plus a constant offset to tell the two streams apart.
struct DummyMaker {
    reward_offset: f64,
}

impl ExperienceMaker for DummyMaker {
    type Experience = Experience;

    fn make_experience(
        &mut self,
        prompts: &[String],
        samples_per_prompt: usize,
    ) -> Result<Experience> {
        let batch_size = (prompts.len() * samples_per_prompt) as i64;
        let total_len = NUM_ACTIONS + 2;
        Ok(Experience {
            sequences: Tensor::zeros(&[batch_size, total_len], (tch::Kind::Int64, Device::Cpu)),
            attention_mask: Tensor::ones(&[batch_size, total_len], tch::kind::FLOAT_CPU),
            action_mask: Tensor::ones(&[batch_size, NUM_ACTIONS], tch::kind::FLOAT_CPU),
            action_log_probs: Tensor::rand(&[batch_size, NUM_ACTIONS], tch::kind::FLOAT_CPU)
                - 2.0,
            info: ExperienceInfo {
                reward: Tensor::rand(&[batch_size], tch::kind::FLOAT_CPU) + self.reward_offset,
                untransformed_reward: Tensor::rand(&[batch_size], tch::kind::FLOAT_CPU),
                kl: Tensor::rand(&[batch_size], tch::kind::FLOAT_CPU) * 0.1,
                response_length: Tensor::ones(&[batch_size], tch::kind::FLOAT_CPU)
                    * NUM_ACTIONS as f64,
                total_length: Tensor::ones(&[batch_size], tch::kind::FLOAT_CPU)
                    * total_len as f64,
            },
        })
    }
}

#[derive(Clone)]
struct RecordingWriter {
    tags: Rc<RefCell<Vec<String>>>,
}

impl RecordingWriter {
    fn new() -> Self {
        Self {
            tags: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl CheckpointWriter for RecordingWriter {
    fn save_checkpoint(&mut self, tag: &str) -> Result<()> {
        self.tags.borrow_mut().push(tag.to_string());
        Ok(())
    }
}

fn prompt_batches(n: usize) -> Vec<Vec<String>> {
    (0..n)
        .map(|i| vec![format!("prompt {}a", i), format!("prompt {}b", i)])
        .collect()
}

fn trainer_config() -> TrainerConfig {
    TrainerConfig::default()
        .samples_per_prompt(SAMPLES_PER_PROMPT)
        .rollout_batch_size(4)
        .update_timesteps(2)
        .max_epochs(2)
        .kl_target(Some(6.0))
        .save_interval(2)
}

fn buffer() -> TwistReplayBuffer {
    TwistReplayBuffer::new(TwistReplayBufferConfig::default().sample_batch_size(4))
}

fn actor_config(loss: ActorLossConfig) -> ActorTrainerConfig {
    ActorTrainerConfig::default()
        .loss(loss)
        .opt_config(OptimizerConfig::Adam { lr: 0.1 })
        .samples_per_prompt(SAMPLES_PER_PROMPT)
}

#[test]
fn test_reinforce_training_loop() -> Result<()> {
    let _ = env_logger::try_init();

    let writer = RecordingWriter::new();
    let mut trainer = HarmlessnessTrainer::build(
        trainer_config(),
        buffer(),
        buffer(),
        SingleProcess,
        Some(writer.clone()),
    )?;
    let mut agent = ActorTrainer::build(
        actor_config(ActorLossConfig::Reinforce {
            baseline: Baseline::BatchMean,
        }),
        ToyPolicy::new(),
        None,
        None,
        Device::Cpu,
    )?;
    let mut maker = DummyMaker { reward_offset: 5.0 };
    let mut maker_neg = DummyMaker { reward_offset: 0.0 };

    let statuses = trainer.fit(&mut agent, &mut maker, &mut maker_neg, &prompt_batches(4))?;

    // Two optimization passes: after rollouts 2 and 4.
    assert_eq!(statuses.len(), 2);
    assert_eq!(trainer.total_steps(), 4);
    for status in &statuses {
        assert!(status.get_scalar("actor_loss").is_ok());
        assert!(status.get_scalar("kl").is_ok());
        assert!(status.get_scalar("reward").is_ok());
        assert!(matches!(
            status.get("datetime"),
            Some(RecordValue::DateTime(_))
        ));
    }

    // Checkpoints at the configured cadence, tagged by step count.
    assert_eq!(
        *writer.tags.borrow(),
        vec!["total_step2".to_string(), "total_step4".to_string()]
    );

    // The policy actually moved.
    assert!(agent.policy().bias_value() != 0.0);
    Ok(())
}

#[test]
fn test_negative_stream_training_loop() -> Result<()> {
    let mut trainer = HarmlessnessTrainer::build(
        trainer_config(),
        buffer(),
        buffer(),
        SingleProcess,
        None::<RecordingWriter>,
    )?;
    let mut agent = ActorTrainer::build(
        actor_config(ActorLossConfig::NegTraining {
            alpha: 0.5,
            baseline: Baseline::BatchMean,
        }),
        ToyPolicy::new(),
        Some(ToyPolicy::new()),
        None,
        Device::Cpu,
    )?;
    let mut maker = DummyMaker { reward_offset: 5.0 };
    let mut maker_neg = DummyMaker { reward_offset: 0.0 };

    let statuses = trainer.fit(&mut agent, &mut maker, &mut maker_neg, &prompt_batches(4))?;
    assert_eq!(statuses.len(), 2);
    assert!(trainer.kl_coef() > 0.0);
    Ok(())
}

#[test]
fn test_mismatched_streams_fail() -> Result<()> {
    // The negative maker returns three samples per prompt while the
    // on-policy maker returns two, so the buffers yield different
    // mini-batch counts.
    struct WideMaker;
    impl ExperienceMaker for WideMaker {
        type Experience = Experience;
        fn make_experience(
            &mut self,
            prompts: &[String],
            samples_per_prompt: usize,
        ) -> Result<Experience> {
            DummyMaker { reward_offset: 0.0 }
                .make_experience(prompts, samples_per_prompt + 1)
        }
    }

    let mut trainer = HarmlessnessTrainer::build(
        trainer_config(),
        buffer(),
        buffer(),
        SingleProcess,
        None::<RecordingWriter>,
    )?;
    let mut agent = ActorTrainer::build(
        actor_config(ActorLossConfig::NegTraining {
            alpha: 0.5,
            baseline: Baseline::None,
        }),
        ToyPolicy::new(),
        Some(ToyPolicy::new()),
        None,
        Device::Cpu,
    )?;
    let mut maker = DummyMaker { reward_offset: 5.0 };
    let mut maker_neg = WideMaker;

    let result = trainer.fit(&mut agent, &mut maker, &mut maker_neg, &prompt_batches(2));
    assert!(result.is_err());
    Ok(())
}

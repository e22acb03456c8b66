//! Autoregressive rollout driver built on top of the pure model.
//!
//! The driver owns the growing action history on the caller's behalf and
//! walks a small state machine per control step: a new observation arrives,
//! the actuators of that timestep are decoded one at a time (each sampled
//! bin is appended to the history before the next actuator's forward pass,
//! so later actuators condition on earlier ones), and the step completes.
//! There is no internal termination; the caller stops requesting steps.

use candle::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::conditioning::CondDrop;
use crate::error::{Error, Result};
use crate::instruction::Instruction;
use crate::model::RoboticTransformer;

/// Where the driver is within one control step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    /// Waiting for the next frame(s) from the environment.
    AwaitingObservation,
    /// Decoding actuator `actuator` of the current timestep.
    DecodingActuator { actuator: usize },
    /// All actuators of the current timestep are filled.
    StepComplete,
}

/// Bin selection for one actuator slot. Argmax, or temperature-softmax
/// sampling from the caller's generator.
pub enum BinSelection<'r> {
    Argmax,
    Sample { rng: &'r mut StdRng, temperature: f64 },
}

impl BinSelection<'_> {
    fn pick(&mut self, logits: &Tensor) -> Result<u32> {
        match self {
            BinSelection::Argmax => {
                let bin = logits.argmax(0)?.to_scalar::<u32>()?;
                Ok(bin)
            }
            BinSelection::Sample { rng, temperature } => {
                let scaled = (logits / *temperature)?;
                let probs = candle_nn::ops::softmax(&scaled, 0)?.to_vec1::<f32>()?;
                let dist = WeightedIndex::new(&probs).map_err(candle::Error::wrap)?;
                Ok(dist.sample(rng) as u32)
            }
        }
    }
}

pub struct Rollout<'m> {
    model: &'m RoboticTransformer,
    instruction: Instruction,
    guidance_scale: f64,
    video: Option<Tensor>,
    history: Vec<Vec<u32>>,
    frames_seen: usize,
    steps_decoded: usize,
    state: RolloutState,
}

impl<'m> Rollout<'m> {
    pub fn new(
        model: &'m RoboticTransformer,
        instruction: Instruction,
        batch: usize,
    ) -> Result<Self> {
        if batch == 0 {
            return Err(Error::config("rollout batch size must be positive"));
        }
        Ok(Self {
            model,
            instruction,
            guidance_scale: 1.0,
            video: None,
            history: vec![Vec::new(); batch],
            frames_seen: 0,
            steps_decoded: 0,
            state: RolloutState::AwaitingObservation,
        })
    }

    /// Guidance scale used for every decode forward. 1 disables the
    /// unconditioned pass.
    pub fn with_guidance_scale(mut self, scale: f64) -> Self {
        self.guidance_scale = scale;
        self
    }

    pub fn state(&self) -> RolloutState {
        self.state
    }

    /// Discretized action history so far, one row per batch element, in
    /// timestep-major / actuator-minor order.
    pub fn history(&self) -> &[Vec<u32>] {
        &self.history
    }

    /// Appends newly observed frames, `(batch, channel, time, height,
    /// width)`, to the clip and arms decoding for every new timestep.
    pub fn observe(&mut self, frames: &Tensor) -> Result<()> {
        if matches!(self.state, RolloutState::DecodingActuator { .. }) {
            return Err(Error::config(
                "observe called before the current step finished decoding",
            ));
        }
        let video = match &self.video {
            None => frames.clone(),
            Some(prev) => Tensor::cat(&[prev, frames], 2)?,
        };
        self.frames_seen = video.dim(2)?;
        self.video = Some(video);
        self.state = RolloutState::DecodingActuator { actuator: 0 };
        Ok(())
    }

    fn history_tensor(&self) -> Result<Option<Tensor>> {
        let len = self.history[0].len();
        if len == 0 {
            return Ok(None);
        }
        let device = self
            .video
            .as_ref()
            .map(|v| v.device().clone())
            .unwrap_or(candle::Device::Cpu);
        let flat: Vec<u32> = self.history.iter().flat_map(|row| row.iter().copied()).collect();
        Ok(Some(Tensor::from_vec(
            flat,
            (self.history.len(), len),
            &device,
        )?))
    }

    /// Decodes every observed-but-undecoded timestep in order, feeding each
    /// chosen bin back into the history before the next actuator is
    /// predicted. Timesteps are decoded oldest first so the flat history
    /// keeps its timestep-major layout when several frames were observed at
    /// once. Returns the newest timestep's bins, one row per batch element;
    /// earlier pending timesteps' bins land in [`Rollout::history`].
    pub fn decode_step(&mut self, mut selection: BinSelection) -> Result<Vec<Vec<u32>>> {
        if !matches!(self.state, RolloutState::DecodingActuator { .. }) {
            return Err(Error::config(
                "decode_step called without a pending observation",
            ));
        }
        let num_actuators = self.model.config().decoder.num_actuators;
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| Error::config("decode_step called before any observation"))?
            .clone();

        let mut step = vec![Vec::with_capacity(num_actuators); self.history.len()];
        for t in self.steps_decoded..self.frames_seen {
            for row in step.iter_mut() {
                row.clear();
            }
            for actuator in 0..num_actuators {
                self.state = RolloutState::DecodingActuator { actuator };
                let history = self.history_tensor()?;
                let logits = if self.guidance_scale == 1.0 {
                    self.model
                        .forward(&video, &self.instruction, history.as_ref(), CondDrop::Keep)?
                } else {
                    self.model.forward_with_guidance(
                        &video,
                        &self.instruction,
                        history.as_ref(),
                        self.guidance_scale,
                    )?
                };
                let slot = self.model.slot_logits(&logits, t, actuator)?.to_dtype(DType::F32)?;
                for (b, row) in self.history.iter_mut().enumerate() {
                    let bin = selection.pick(&slot.get(b)?)?;
                    row.push(bin);
                    step[b].push(bin);
                }
            }
            self.steps_decoded = t + 1;
        }
        self.state = RolloutState::StepComplete;
        Ok(step)
    }

    /// Converts one step's bins to continuous commands via the model's
    /// discretizer.
    pub fn step_values(&self, step: &[Vec<u32>]) -> Result<Vec<Vec<f64>>> {
        step.iter()
            .map(|row| self.model.discretizer().bins_to_values(row))
            .collect()
    }
}

//! Token sampling pipeline
//!
//! Turns one logits row into one token. The stage order is fixed: logit
//! bias, newline guard, repetition penalty, frequency/presence penalty,
//! then either the greedy short-circuit, one of the mirostat samplers, or
//! the truncation chain top-k, tail-free, typical, top-p, temperature and
//! a weighted draw.

pub mod candidates;

pub use candidates::{Candidates, TokenData};

use crate::backend::Token;
use crate::model::RingHistory;
use crate::{CoreError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Candidate cap used by mirostat 1.0 when estimating the Zipf exponent
const MIROSTAT_V1_M: usize = 100;

/// Minimum number of candidates every truncation stage keeps
const MIN_KEEP: usize = 1;

/// Adaptive mirostat variant
///
/// Deserializes from the numeric wire form (`0`, `1`, `2`) or from the
/// names `"off"`, `"v1"`, `"v2"`; always serializes as a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "MirostatWire")]
pub enum MirostatMode {
    #[default]
    Off,
    V1,
    V2,
}

impl MirostatMode {
    /// Map the numeric mode used on the wire (0, 1, 2)
    pub fn from_version(version: i32) -> Result<Self> {
        match version {
            0 => Ok(Self::Off),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(CoreError::invalid_parameter(
                "INVALID_MIROSTAT_MODE",
                format!("Unknown mirostat mode {}", other),
                "Use 0 (off), 1 or 2",
                "mirostat",
                other.to_string(),
                "0, 1, 2",
            )),
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        match name {
            "off" => Ok(Self::Off),
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(CoreError::invalid_parameter(
                "INVALID_MIROSTAT_MODE",
                format!("Unknown mirostat mode '{}'", other),
                "Use \"off\", \"v1\" or \"v2\"",
                "mirostat",
                other,
                "off, v1, v2",
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MirostatWire {
    Version(i32),
    Name(String),
}

impl TryFrom<MirostatWire> for MirostatMode {
    type Error = CoreError;

    fn try_from(wire: MirostatWire) -> Result<Self> {
        match wire {
            MirostatWire::Version(version) => Self::from_version(version),
            MirostatWire::Name(name) => Self::from_name(&name),
        }
    }
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleParams {
    /// Additive bias per token id
    pub logit_bias: HashMap<Token, f32>,

    /// Keep the k highest-logit candidates (0 disables)
    pub top_k: usize,

    /// Nucleus threshold (1.0 disables)
    pub top_p: f32,

    /// Tail-free z (1.0 disables)
    pub tfs_z: f32,

    /// Locally typical p (1.0 disables)
    pub typical_p: f32,

    /// Temperature; negative selects greedy argmax
    pub temperature: f32,

    pub repeat_penalty: f32,

    /// Recent tokens considered by the penalties
    pub repeat_window: usize,

    pub frequency_penalty: f32,

    pub presence_penalty: f32,

    pub mirostat: MirostatMode,

    /// Target surprise for mirostat
    pub mirostat_tau: f32,

    /// Learning rate for mirostat
    pub mirostat_eta: f32,

    /// Let the penalties apply to the newline token too
    pub penalize_newline: bool,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            logit_bias: HashMap::new(),
            top_k: 40,
            top_p: 0.95,
            tfs_z: 1.0,
            typical_p: 1.0,
            temperature: 0.8,
            repeat_penalty: 1.1,
            repeat_window: 64,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: MirostatMode::Off,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalize_newline: false,
        }
    }
}

impl SampleParams {
    /// Greedy parameters: deterministic argmax after penalties
    pub fn greedy() -> Self {
        Self {
            temperature: -1.0,
            ..Default::default()
        }
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        let scalars = [
            ("top_p", self.top_p),
            ("tfs_z", self.tfs_z),
            ("typical_p", self.typical_p),
            ("temperature", self.temperature),
            ("repeat_penalty", self.repeat_penalty),
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
            ("mirostat_tau", self.mirostat_tau),
            ("mirostat_eta", self.mirostat_eta),
        ];
        for (name, value) in scalars {
            if !value.is_finite() {
                return Err(CoreError::invalid_parameter(
                    "INVALID_SAMPLING_PARAM",
                    format!("{} must be a finite number", name),
                    "Provide a finite value",
                    name,
                    value.to_string(),
                    "finite",
                ));
            }
        }

        for (name, value) in [
            ("top_p", self.top_p),
            ("tfs_z", self.tfs_z),
            ("typical_p", self.typical_p),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoreError::invalid_parameter(
                    "INVALID_SAMPLING_PARAM",
                    format!("{} must be between 0.0 and 1.0", name),
                    "Use 1.0 to disable the filter",
                    name,
                    value.to_string(),
                    "0.0-1.0",
                ));
            }
        }

        if self.repeat_penalty <= 0.0 {
            return Err(CoreError::invalid_parameter(
                "INVALID_SAMPLING_PARAM",
                "repeat_penalty must be positive",
                "Use 1.0 to disable the penalty",
                "repeat_penalty",
                self.repeat_penalty.to_string(),
                "> 0.0",
            ));
        }

        if self.mirostat != MirostatMode::Off {
            for (name, value) in [
                ("mirostat_tau", self.mirostat_tau),
                ("mirostat_eta", self.mirostat_eta),
            ] {
                if value <= 0.0 {
                    return Err(CoreError::invalid_parameter(
                        "INVALID_SAMPLING_PARAM",
                        format!("{} must be positive when mirostat is enabled", name),
                        "Use the defaults tau = 5.0, eta = 0.1",
                        name,
                        value.to_string(),
                        "> 0.0",
                    ));
                }
            }
        }

        if let Some((token, bias)) = self.logit_bias.iter().find(|(_, bias)| bias.is_nan()) {
            return Err(CoreError::invalid_parameter(
                "INVALID_SAMPLING_PARAM",
                format!("logit bias for token {} is NaN", token),
                "Use a number or +/- infinity",
                "logit_bias",
                bias.to_string(),
                "not NaN",
            ));
        }

        Ok(())
    }

    /// Recent tokens fed to the penalties: at most
    /// `min(repeat_window, history length, context_size)` tokens
    pub fn penalty_window(&self, history: &RingHistory, context_size: usize) -> Vec<Token> {
        let n = self.repeat_window.min(history.len()).min(context_size);
        history.read_last_n(n)
    }
}

/// Running mirostat target surprise for one generation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirostatState {
    pub mu: f32,
}

impl MirostatState {
    pub fn new(tau: f32) -> Self {
        Self { mu: 2.0 * tau }
    }
}

/// Sample one token from `logits`
///
/// `recent` is the penalty window (see [`SampleParams::penalty_window`]).
/// `mirostat` is only read and updated when a mirostat mode is active.
pub fn sample<R: Rng + ?Sized>(
    logits: &[f32],
    params: &SampleParams,
    recent: &[Token],
    newline: Token,
    mirostat: &mut MirostatState,
    rng: &mut R,
) -> Result<Token> {
    if logits.is_empty() {
        return Err(empty_logits());
    }

    let mut logits = logits.to_vec();
    for (&token, &bias) in &params.logit_bias {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit += bias;
        }
    }

    let mut candidates = Candidates::from_logits(&logits);

    let newline_logit = if params.penalize_newline {
        None
    } else {
        candidates.logit(newline)
    };

    candidates.apply_repetition_penalty(recent, params.repeat_penalty);
    candidates.apply_frequency_presence(recent, params.frequency_penalty, params.presence_penalty);

    if let Some(logit) = newline_logit {
        candidates.set_logit(newline, logit);
    }

    let token = if params.temperature < 0.0 {
        candidates.greedy()
    } else {
        match params.mirostat {
            MirostatMode::V1 => {
                candidates.temperature(params.temperature);
                candidates.mirostat_v1(
                    params.mirostat_tau,
                    params.mirostat_eta,
                    MIROSTAT_V1_M,
                    &mut mirostat.mu,
                    rng,
                )
            }
            MirostatMode::V2 => {
                candidates.temperature(params.temperature);
                candidates.mirostat_v2(params.mirostat_tau, params.mirostat_eta, &mut mirostat.mu, rng)
            }
            MirostatMode::Off => {
                candidates.top_k(params.top_k, MIN_KEEP);
                candidates.tail_free(params.tfs_z, MIN_KEEP);
                candidates.typical(params.typical_p, MIN_KEEP);
                candidates.top_p(params.top_p, MIN_KEEP);
                candidates.temperature(params.temperature);
                candidates.draw(rng)
            }
        }
    };

    let token = token.ok_or_else(empty_logits)?;
    trace!("Sampled token {} (mu = {:.3})", token, mirostat.mu);
    Ok(token)
}

fn empty_logits() -> CoreError {
    CoreError::backend(
        "EMPTY_LOGITS",
        "Token sampling",
        "Check that evaluate produced a logits row",
        anyhow::anyhow!("cannot sample from an empty logits row"),
    )
}

use serde::{Deserialize, Serialize};

use crate::error::{EmaError, Result};

pub const DEFAULT_NAME: &str = "ExponentialMovingAverage";

/// Configuration for an [`ExponentialMovingAverage`](crate::tracker::ExponentialMovingAverage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Decay applied to the previous average, in (0,1).
    pub decay: f32,
    /// When set, early steps use `min(decay, (1 + n) / (10 + n))` so the
    /// average follows new values closely at first.
    pub num_updates: Option<u64>,
    /// Correct the startup bias of averages that begin at zero.
    pub zero_debias: bool,
    /// Appended to every tracked name to form the average's name.
    pub name: String,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            decay: 0.999,
            num_updates: None,
            zero_debias: false,
            name: DEFAULT_NAME.to_string(),
        }
    }
}

impl DecayConfig {
    pub fn new(decay: f32) -> Self {
        Self {
            decay,
            ..Self::default()
        }
    }

    pub fn with_num_updates(mut self, num_updates: u64) -> Self {
        self.num_updates = Some(num_updates);
        self
    }

    pub fn with_zero_debias(mut self, zero_debias: bool) -> Self {
        self.zero_debias = zero_debias;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(EmaError::InvalidDecay(self.decay));
        }
        Ok(())
    }

    /// Decay to use when the shared step counter reads `num_updates`.
    pub fn effective_decay(&self, num_updates: Option<u64>) -> f32 {
        match num_updates {
            Some(n) => {
                let n = n as f32;
                self.decay.min((1.0 + n) / (10.0 + n))
            }
            None => self.decay,
        }
    }
}

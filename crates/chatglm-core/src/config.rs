//! Generation settings and their translation into the engine's native
//! configuration.

use std::mem::ManuallyDrop;
use std::os::raw::c_int;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backend::Backend;
use crate::error::{ChatGlmError, Result};

/// User-facing generation settings.
///
/// Missing fields fall back to the engine defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_length")]
    pub max_length: u32,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: u32,
    #[serde(default = "default_do_sample")]
    pub do_sample: bool,
    /// 0 disables top-k filtering.
    #[serde(default)]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    /// 0 lets the engine pick the thread count.
    #[serde(default)]
    pub num_threads: u32,
}

fn default_max_length() -> u32 {
    2048
}
fn default_max_context_length() -> u32 {
    512
}
fn default_do_sample() -> bool {
    true
}
fn default_top_p() -> f32 {
    0.7
}
fn default_temperature() -> f32 {
    0.95
}
fn default_repetition_penalty() -> f32 {
    1.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            max_context_length: default_max_context_length(),
            do_sample: default_do_sample(),
            top_k: 0,
            top_p: default_top_p(),
            temperature: default_temperature(),
            repetition_penalty: default_repetition_penalty(),
            num_threads: 0,
        }
    }
}

/// A single override of one [`GenerationConfig`] field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GenerateOption {
    MaxLength(u32),
    MaxContextLength(u32),
    DoSample(bool),
    TopK(u32),
    TopP(f32),
    Temperature(f32),
    RepetitionPenalty(f32),
    NumThreads(u32),
}

impl GenerateOption {
    /// Overwrite the matching field of `config`.
    pub fn apply(self, config: &mut GenerationConfig) {
        match self {
            Self::MaxLength(v) => config.max_length = v,
            Self::MaxContextLength(v) => config.max_context_length = v,
            Self::DoSample(v) => config.do_sample = v,
            Self::TopK(v) => config.top_k = v,
            Self::TopP(v) => config.top_p = v,
            Self::Temperature(v) => config.temperature = v,
            Self::RepetitionPenalty(v) => config.repetition_penalty = v,
            Self::NumThreads(v) => config.num_threads = v,
        }
    }
}

impl GenerationConfig {
    /// Defaults with `options` applied in order; the last write to a field wins.
    pub fn from_options(options: impl IntoIterator<Item = GenerateOption>) -> Self {
        let mut config = Self::default();
        for option in options {
            option.apply(&mut config);
        }
        config
    }

    pub fn with(mut self, option: GenerateOption) -> Self {
        option.apply(&mut self);
        self
    }

    pub fn with_max_length(self, v: u32) -> Self {
        self.with(GenerateOption::MaxLength(v))
    }

    pub fn with_max_context_length(self, v: u32) -> Self {
        self.with(GenerateOption::MaxContextLength(v))
    }

    pub fn with_do_sample(self, v: bool) -> Self {
        self.with(GenerateOption::DoSample(v))
    }

    pub fn with_top_k(self, v: u32) -> Self {
        self.with(GenerateOption::TopK(v))
    }

    pub fn with_top_p(self, v: f32) -> Self {
        self.with(GenerateOption::TopP(v))
    }

    pub fn with_temperature(self, v: f32) -> Self {
        self.with(GenerateOption::Temperature(v))
    }

    pub fn with_repetition_penalty(self, v: f32) -> Self {
        self.with(GenerateOption::RepetitionPenalty(v))
    }

    pub fn with_num_threads(self, v: u32) -> Self {
        self.with(GenerateOption::NumThreads(v))
    }

    /// Reject values the engine cannot represent or would misbehave on.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("max_length", self.max_length),
            ("max_context_length", self.max_context_length),
            ("top_k", self.top_k),
            ("num_threads", self.num_threads),
        ] {
            to_c_int(name, v)?;
        }
        if !(self.top_p.is_finite() && (0.0..=1.0).contains(&self.top_p)) {
            return Err(ChatGlmError::InvalidConfig(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.temperature.is_finite() && self.temperature >= 0.0) {
            return Err(ChatGlmError::InvalidConfig(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(ChatGlmError::InvalidConfig(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Convert a count into the engine's C `int`.
pub fn to_c_int(name: &str, v: u32) -> Result<c_int> {
    c_int::try_from(v).map_err(|_| {
        ChatGlmError::InvalidConfig(format!("{name} = {v} does not fit the engine's int range"))
    })
}

/// Native configuration resource scoped to a single generate call.
///
/// Created by [`ScopedConfig::acquire`] and released through the backend when
/// dropped, on success and failure alike.
pub struct ScopedConfig<'a, B: Backend> {
    backend: &'a B,
    raw: ManuallyDrop<B::Config>,
}

impl<'a, B: Backend> ScopedConfig<'a, B> {
    pub fn acquire(backend: &'a B, config: &GenerationConfig) -> Result<Self> {
        config.validate()?;
        let raw = backend.create_config(config)?;
        trace!(backend = backend.name(), "Native generation config created");
        Ok(Self {
            backend,
            raw: ManuallyDrop::new(raw),
        })
    }

    pub fn raw(&self) -> &B::Config {
        &self.raw
    }
}

impl<B: Backend> Drop for ScopedConfig<'_, B> {
    fn drop(&mut self) {
        // Safety: `raw` is taken exactly once, here, and never touched again.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        self.backend.destroy_config(raw);
        trace!(backend = self.backend.name(), "Native generation config released");
    }
}

//! Generation configuration
//!
//! [`LlmConfig`] holds the tunables shared by the lifecycle manager (context
//! size, GPU layers) and the generation engine (sampling parameters).

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// `gpu_layers` value meaning "offload every layer the runtime can"
pub const GPU_LAYERS_AUTO: i32 = -1;

/// Runtime-facing model and sampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Context window size requested on load
    pub context_size: u32,
    /// Layers to offload (-1 = all, 0 = CPU only, N = explicit count)
    pub gpu_layers: i32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Top-k sampling parameter. Signed so bad values reach the runtime as-is.
    pub top_k: i32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            gpu_layers: GPU_LAYERS_AUTO,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

impl LlmConfig {
    /// Shallow-merges every field present in `update`.
    pub fn merge(&mut self, update: &LlmConfigUpdate) {
        if let Some(v) = update.context_size {
            self.context_size = v;
        }
        if let Some(v) = update.gpu_layers {
            self.gpu_layers = v;
        }
        if let Some(v) = update.temperature {
            self.temperature = v;
        }
        if let Some(v) = update.top_p {
            self.top_p = v;
        }
        if let Some(v) = update.top_k {
            self.top_k = v;
        }
    }

    /// Sampling subset, as read at the start of a generation
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
        }
    }
}

/// Partial [`LlmConfig`]; `None` fields are left untouched on merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfigUpdate {
    pub context_size: Option<u32>,
    pub gpu_layers: Option<i32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<i32>,
}

impl LlmConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Sampling parameters handed to the runtime's prompt call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
}

/// Shared holder of the current [`LlmConfig`].
///
/// Readers always get a copy, so nothing outside the store can mutate it.
#[derive(Debug, Default)]
pub struct ConfigStore {
    inner: RwLock<LlmConfig>,
}

impl ConfigStore {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Returns a snapshot of the current configuration
    pub fn get(&self) -> LlmConfig {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merges `update` into the current configuration and returns the result
    pub fn update(&self, update: &LlmConfigUpdate) -> LlmConfig {
        let mut config = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        config.merge(update);
        tracing::debug!("Config updated: {:?}", *config);
        *config
    }
}

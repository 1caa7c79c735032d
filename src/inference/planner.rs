//! Load strategy planning
//!
//! Enumerates the (compute mode, context size) ladder a load walks down, and
//! decides which failures are worth another rung.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Context size reduction between two rungs of the same strategy
pub const CONTEXT_SIZE_STEP: u32 = 1000;

/// Smallest context size the ladder will try
pub const MIN_CONTEXT_SIZE: u32 = 2000;

/// One rung of the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadAttempt {
    pub use_gpu: bool,
    pub context_size: u32,
}

impl LoadAttempt {
    /// GPU layer count to request for this attempt
    pub fn gpu_layers(&self, desired_gpu_layers: i32) -> i32 {
        if self.use_gpu {
            desired_gpu_layers
        } else {
            0
        }
    }
}

/// Enumerates every attempt in the order it must be tried.
///
/// GPU attempts (with `desired_gpu_layers`) come first, then CPU-only ones.
/// Each strategy walks the context size down from `desired_context_size` by
/// [`CONTEXT_SIZE_STEP`] while it stays at or above [`MIN_CONTEXT_SIZE`]. A
/// desired size already below the floor is tried once as-is. When the caller
/// already asked for CPU only, the GPU strategy would repeat the CPU one and is
/// left out.
pub fn plan_attempts(desired_context_size: u32, desired_gpu_layers: i32) -> Vec<LoadAttempt> {
    let sizes = context_sizes(desired_context_size);
    let strategies: &[bool] = if desired_gpu_layers == 0 {
        &[false]
    } else {
        &[true, false]
    };

    strategies
        .iter()
        .flat_map(|&use_gpu| {
            sizes.iter().map(move |&context_size| LoadAttempt {
                use_gpu,
                context_size,
            })
        })
        .collect()
}

fn context_sizes(desired: u32) -> Vec<u32> {
    if desired < MIN_CONTEXT_SIZE {
        return vec![desired];
    }
    let mut sizes = Vec::new();
    let mut size = desired;
    while size >= MIN_CONTEXT_SIZE {
        sizes.push(size);
        match size.checked_sub(CONTEXT_SIZE_STEP) {
            Some(next) => size = next,
            None => break,
        }
    }
    sizes
}

/// How a failed attempt affects the rest of the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Resource pressure: a smaller context (or CPU) may still work
    Recoverable,
    /// Anything else: stop walking the current strategy
    Fatal,
}

/// What a fatal failure on the GPU strategy does to the CPU strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalErrorPolicy {
    /// Skip the remaining GPU rungs and carry on with CPU-only
    #[default]
    FallBackToCpu,
    /// End the load on the first fatal failure
    Abort,
}

static RESOURCE_PRESSURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)out of memory|\boom\b|vram|context size|too large|memory|failed to allocate|allocation failed",
    )
    .expect("resource pressure pattern is a valid regex")
});

/// Classifies a failure by its message
pub fn classify_failure(message: &str) -> FailureKind {
    if RESOURCE_PRESSURE.is_match(message) {
        FailureKind::Recoverable
    } else {
        FailureKind::Fatal
    }
}

/// Classifies a load failure for the model at `model_path`.
///
/// The path is cut out of the message first, so a file named `memory.gguf`
/// cannot make a fatal error look like resource pressure.
pub fn classify_load_failure(message: &str, model_path: &Path) -> FailureKind {
    let path = model_path.display().to_string();
    if path.is_empty() {
        return classify_failure(message);
    }
    classify_failure(&message.replace(&path, ""))
}

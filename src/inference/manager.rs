//! Model lifecycle management
//!
//! [`ModelManager`] is the only owner of the Model/Context/Session chain. It
//! lazily brings the runtime up, walks the load ladder, and guarantees that
//! every exit path (success, failure, unload, dispose) leaves no live handles
//! behind except the single active chain.
//!
//! All state transitions, and generation through [`ModelManager::active`], are
//! serialized by one async mutex. Status queries read a separate snapshot so
//! they never wait behind a long load.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex, MutexGuard};

use crate::inference::config::{ConfigStore, LlmConfig, LlmConfigUpdate};
use crate::inference::error::{InitError, LoadError};
use crate::inference::handles::LoadedModel;
use crate::inference::planner::{
    classify_load_failure, plan_attempts, FailureKind, FatalErrorPolicy, LoadAttempt,
};
use crate::inference::runtime::{InferenceRuntime, RuntimeProvider};

/// Lifecycle state of the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

#[derive(Debug, Clone, Default)]
struct StatusSnapshot {
    state: ModelState,
    path: Option<PathBuf>,
    attempt: Option<LoadAttempt>,
}

struct ManagerInner<R: InferenceRuntime> {
    runtime: Option<R>,
    loaded: Option<LoadedModel<R>>,
    disposed: bool,
}

/// Owner of the active model and the runtime it was loaded with
pub struct ModelManager<P: RuntimeProvider> {
    provider: P,
    config: Arc<ConfigStore>,
    policy: FatalErrorPolicy,
    inner: Mutex<ManagerInner<P::Runtime>>,
    status: RwLock<StatusSnapshot>,
}

impl<P: RuntimeProvider> ModelManager<P> {
    pub fn new(provider: P, config: Arc<ConfigStore>) -> Self {
        Self {
            provider,
            config,
            policy: FatalErrorPolicy::default(),
            inner: Mutex::new(ManagerInner {
                runtime: None,
                loaded: None,
                disposed: false,
            }),
            status: RwLock::new(StatusSnapshot::default()),
        }
    }

    /// Sets what a fatal failure on the GPU strategy does to the CPU strategy
    pub fn with_fatal_error_policy(mut self, policy: FatalErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fatal_error_policy(&self) -> FatalErrorPolicy {
        self.policy
    }

    /// Brings the runtime up. Calling it again is a no-op.
    ///
    /// This is also the only way back from [`ModelManager::dispose`].
    pub async fn initialize(&self) -> Result<(), InitError> {
        let mut inner = self.inner.lock().await;
        self.ensure_runtime(&mut inner).await?;
        inner.disposed = false;
        Ok(())
    }

    /// Loads the model at `path`, unloading any current one first.
    ///
    /// `update` is merged into the configuration before the ladder is
    /// planned. On success the configuration reflects the context size and GPU
    /// layers that actually worked. On failure nothing stays loaded.
    pub async fn load_model(
        &self,
        path: &Path,
        update: Option<&LlmConfigUpdate>,
    ) -> Result<(), LoadError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if inner.disposed {
            return Err(LoadError::Disposed);
        }

        self.unload_locked(inner).await;

        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!("Model file does not exist: {}", path.display());
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        self.ensure_runtime(inner).await?;
        let Some(runtime) = inner.runtime.as_ref() else {
            return Err(InitError::Backend("runtime missing after initialization".to_string()).into());
        };

        let config = match update {
            Some(update) => self.config.update(update),
            None => self.config.get(),
        };

        self.set_status(ModelState::Loading, None);
        let loading = StatusReset::new(&self.status);
        tracing::info!(
            "Loading model {} (context size {}, gpu layers {})",
            path.display(),
            config.context_size,
            config.gpu_layers
        );

        match self.run_ladder(runtime, path, &config).await {
            Ok(loaded) => {
                let attempt = loaded.attempt();
                self.config.update(&LlmConfigUpdate {
                    context_size: Some(attempt.context_size),
                    gpu_layers: Some(attempt.gpu_layers(config.gpu_layers)),
                    ..Default::default()
                });
                self.set_status(ModelState::Loaded, Some((loaded.path(), attempt)));
                loading.disarm();
                tracing::info!(
                    "Model loaded: {} ({}, context size {})",
                    path.display(),
                    if attempt.use_gpu { "gpu" } else { "cpu" },
                    loaded.context_size()
                );
                inner.loaded = Some(loaded);
                Ok(())
            }
            Err(e) => {
                drop(loading);
                tracing::error!("{}", e);
                Err(e)
            }
        }
    }

    /// Unloads the active model, if any. Never fails.
    pub async fn unload_model(&self) {
        let mut inner = self.inner.lock().await;
        self.unload_locked(&mut inner).await;
    }

    /// Unloads and releases the runtime. [`ModelManager::initialize`] must be
    /// called before the manager can load again.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        self.unload_locked(&mut inner).await;
        if inner.runtime.take().is_some() {
            tracing::info!("Inference runtime released");
        }
        inner.disposed = true;
    }

    pub fn state(&self) -> ModelState {
        self.read_status().state
    }

    pub fn is_model_loaded(&self) -> bool {
        let status = self.read_status();
        status.state == ModelState::Loaded && status.path.is_some()
    }

    pub fn current_model_path(&self) -> Option<PathBuf> {
        self.read_status().path
    }

    /// The ladder rung the active model was loaded with
    pub fn loaded_attempt(&self) -> Option<LoadAttempt> {
        self.read_status().attempt
    }

    /// Locks the lifecycle for as long as the returned guard lives.
    ///
    /// Loads and unloads wait until it is dropped.
    pub async fn active(&self) -> ActiveModel<'_, P::Runtime> {
        ActiveModel {
            guard: self.inner.lock().await,
        }
    }

    async fn ensure_runtime(&self, inner: &mut ManagerInner<P::Runtime>) -> Result<(), InitError> {
        if inner.runtime.is_none() {
            tracing::info!("Initializing inference runtime");
            let runtime = self.provider.init().await.map_err(|e| {
                tracing::error!("Runtime initialization failed: {}", e);
                InitError::from(e)
            })?;
            inner.runtime = Some(runtime);
        }
        Ok(())
    }

    async fn run_ladder(
        &self,
        runtime: &P::Runtime,
        path: &Path,
        config: &LlmConfig,
    ) -> Result<LoadedModel<P::Runtime>, LoadError> {
        let attempts = plan_attempts(config.context_size, config.gpu_layers);
        let mut tried_range: Option<(u32, u32)> = None;
        let mut last_error: Option<String> = None;
        let mut gpu_abandoned = false;

        for attempt in attempts {
            if attempt.use_gpu && gpu_abandoned {
                continue;
            }

            let size = attempt.context_size;
            tried_range = Some(match tried_range {
                Some((hi, lo)) => (hi.max(size), lo.min(size)),
                None => (size, size),
            });
            tracing::debug!(
                "Load attempt: {} with context size {}",
                if attempt.use_gpu { "gpu" } else { "cpu" },
                size
            );

            let error = match LoadedModel::open(runtime, path, attempt, config.gpu_layers).await {
                Ok(loaded) => return Ok(loaded),
                Err(e) => e.to_string(),
            };

            let kind = classify_load_failure(&error, path);
            tracing::warn!(
                "Load attempt failed ({:?}, {}, context size {}): {}",
                kind,
                if attempt.use_gpu { "gpu" } else { "cpu" },
                size,
                error
            );
            last_error = Some(error);

            if kind == FailureKind::Fatal {
                if attempt.use_gpu && self.policy == FatalErrorPolicy::FallBackToCpu {
                    tracing::info!("Abandoning GPU strategy, falling back to CPU only");
                    gpu_abandoned = true;
                } else {
                    break;
                }
            }
        }

        let (hi, lo) = tried_range.unwrap_or((config.context_size, config.context_size));
        Err(LoadError::ExhaustedStrategies {
            last_error: last_error.unwrap_or_else(|| "no load attempts were made".to_string()),
            tried_range: (hi, lo),
        })
    }

    async fn unload_locked(&self, inner: &mut ManagerInner<P::Runtime>) {
        if let Some(loaded) = inner.loaded.take() {
            let path = loaded.path();
            self.set_status(ModelState::Unloading, Some((path.clone(), loaded.attempt())));
            let _unloading = StatusReset::new(&self.status);
            loaded.dispose().await;
            tracing::info!("Model unloaded: {}", path.display());
        }
        self.set_status(ModelState::Unloaded, None);
    }

    fn set_status(&self, state: ModelState, loaded: Option<(PathBuf, LoadAttempt)>) {
        write_status(&self.status, state, loaded);
    }

    fn read_status(&self) -> StatusSnapshot {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn write_status(
    status: &RwLock<StatusSnapshot>,
    state: ModelState,
    loaded: Option<(PathBuf, LoadAttempt)>,
) {
    let mut status = status.write().unwrap_or_else(PoisonError::into_inner);
    status.state = state;
    match loaded {
        Some((path, attempt)) => {
            status.path = Some(path);
            status.attempt = Some(attempt);
        }
        None => {
            status.path = None;
            status.attempt = None;
        }
    }
}

/// Puts the status back to `Unloaded` when dropped while still armed.
///
/// A load or unload future dropped at an await point (for instance by a
/// caller's timeout) would otherwise leave `Loading` or `Unloading` behind.
struct StatusReset<'a> {
    status: &'a RwLock<StatusSnapshot>,
    armed: bool,
}

impl<'a> StatusReset<'a> {
    fn new(status: &'a RwLock<StatusSnapshot>) -> Self {
        Self {
            status,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StatusReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            write_status(self.status, ModelState::Unloaded, None);
        }
    }
}

/// Exclusive view of the active model, held for the duration of a generation
pub struct ActiveModel<'a, R: InferenceRuntime> {
    guard: MutexGuard<'a, ManagerInner<R>>,
}

impl<R: InferenceRuntime> ActiveModel<'_, R> {
    pub fn loaded(&self) -> Option<&LoadedModel<R>> {
        self.guard.loaded.as_ref()
    }
}

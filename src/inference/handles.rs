//! Native resource handles
//!
//! Typed owners for the Model → Context → Session chain. Disposal consumes the
//! handle, so a resource can be released at most once, and [`LoadedModel`]
//! always tears the chain down in reverse creation order.

use std::path::{Path, PathBuf};

use crate::inference::error::RuntimeError;
use crate::inference::planner::LoadAttempt;
use crate::inference::runtime::{
    ContextParams, InferenceRuntime, ModelParams, NativeContext, NativeModel, Token,
};

/// A loaded weight set
pub struct ModelHandle<M> {
    inner: M,
    params: ModelParams,
}

impl<M: NativeModel> ModelHandle<M> {
    pub async fn load<R>(runtime: &R, params: ModelParams) -> Result<Self, RuntimeError>
    where
        R: InferenceRuntime<Model = M>,
    {
        let inner = runtime.load_model(params.clone()).await?;
        Ok(Self { inner, params })
    }

    pub async fn create_context(
        &self,
        context_size: u32,
    ) -> Result<ContextHandle<M::Context>, RuntimeError> {
        let inner = self
            .inner
            .create_context(ContextParams { context_size })
            .await?;
        Ok(ContextHandle {
            inner,
            context_size,
        })
    }

    pub fn detokenize(&self, tokens: &[Token]) -> String {
        self.inner.detokenize(tokens)
    }

    pub fn path(&self) -> &Path {
        &self.params.model_path
    }

    pub async fn dispose(mut self) -> Result<(), RuntimeError> {
        self.inner.dispose().await
    }

    /// Disposes and logs any failure instead of returning it
    pub async fn dispose_quietly(self) {
        let path = self.params.model_path.clone();
        if let Err(e) = self.dispose().await {
            tracing::warn!("Ignoring model dispose failure for {}: {}", path.display(), e);
        }
    }
}

/// A fixed-size context created from a [`ModelHandle`]
pub struct ContextHandle<C> {
    inner: C,
    context_size: u32,
}

impl<C: NativeContext> ContextHandle<C> {
    pub fn context_size(&self) -> u32 {
        self.context_size
    }

    pub fn sequence(&self) -> Result<C::Sequence, RuntimeError> {
        self.inner.sequence()
    }

    pub async fn dispose(mut self) -> Result<(), RuntimeError> {
        self.inner.dispose().await
    }

    pub async fn dispose_quietly(self) {
        let size = self.context_size;
        if let Err(e) = self.dispose().await {
            tracing::warn!("Ignoring context dispose failure (context size {}): {}", size, e);
        }
    }
}

/// The session generation runs through. Holds no native resource of its own.
pub struct SessionHandle<S> {
    inner: S,
}

impl<S> SessionHandle<S> {
    pub fn session(&self) -> &S {
        &self.inner
    }
}

/// A complete, live Model/Context/Session chain
pub struct LoadedModel<R: InferenceRuntime> {
    // Field order mirrors teardown order.
    session: SessionHandle<R::Session>,
    context: ContextHandle<R::Context>,
    model: ModelHandle<R::Model>,
    attempt: LoadAttempt,
}

impl<R: InferenceRuntime> LoadedModel<R> {
    /// Builds the whole chain for one ladder attempt.
    ///
    /// If any step fails, whatever was already created is disposed (context
    /// before model) and the original error is returned.
    pub async fn open(
        runtime: &R,
        path: &Path,
        attempt: LoadAttempt,
        desired_gpu_layers: i32,
    ) -> Result<Self, RuntimeError> {
        let params = ModelParams {
            model_path: path.to_path_buf(),
            gpu_layers: attempt.gpu_layers(desired_gpu_layers),
        };
        let model = ModelHandle::load(runtime, params).await?;

        let context = match model.create_context(attempt.context_size).await {
            Ok(context) => context,
            Err(e) => {
                model.dispose_quietly().await;
                return Err(e);
            }
        };

        let session = match context
            .sequence()
            .and_then(|sequence| runtime.create_session(sequence))
        {
            Ok(inner) => SessionHandle { inner },
            Err(e) => {
                context.dispose_quietly().await;
                model.dispose_quietly().await;
                return Err(e);
            }
        };

        Ok(Self {
            session,
            context,
            model,
            attempt,
        })
    }

    pub fn model(&self) -> &ModelHandle<R::Model> {
        &self.model
    }

    pub fn session(&self) -> &SessionHandle<R::Session> {
        &self.session
    }

    pub fn path(&self) -> PathBuf {
        self.model.path().to_path_buf()
    }

    pub fn attempt(&self) -> LoadAttempt {
        self.attempt
    }

    pub fn context_size(&self) -> u32 {
        self.context.context_size()
    }

    /// Releases session, context and model in that order. Never fails.
    pub async fn dispose(self) {
        let Self {
            session,
            context,
            model,
            ..
        } = self;
        drop(session);
        context.dispose_quietly().await;
        model.dispose_quietly().await;
    }
}

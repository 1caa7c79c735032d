//! Engine facade
//!
//! [`LlmEngine`] is what the host application constructs and hands to its
//! controller layer. It wires the lifecycle manager, the configuration store
//! and the generation engine together; there is no process-wide instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::inference::config::{ConfigStore, LlmConfig, LlmConfigUpdate};
use crate::inference::error::{GenError, InitError, LoadError};
use crate::inference::generation;
use crate::inference::manager::{ModelManager, ModelState};
use crate::inference::planner::FatalErrorPolicy;
use crate::inference::runtime::RuntimeProvider;
use crate::inference::streaming::StreamToken;

/// Local LLM engine: one active model, serialized lifecycle, streaming output
pub struct LlmEngine<P: RuntimeProvider> {
    manager: ModelManager<P>,
    config: Arc<ConfigStore>,
}

impl<P: RuntimeProvider> LlmEngine<P> {
    /// Creates an engine with default configuration. Nothing is initialized
    /// until [`LlmEngine::initialize`] or the first load.
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, LlmConfig::default())
    }

    pub fn with_config(provider: P, config: LlmConfig) -> Self {
        let config = Arc::new(ConfigStore::new(config));
        Self {
            manager: ModelManager::new(provider, Arc::clone(&config)),
            config,
        }
    }

    pub fn with_fatal_error_policy(mut self, policy: FatalErrorPolicy) -> Self {
        self.manager = self.manager.with_fatal_error_policy(policy);
        self
    }

    pub async fn initialize(&self) -> Result<(), InitError> {
        self.manager.initialize().await
    }

    pub async fn load_model<Q: AsRef<Path>>(
        &self,
        path: Q,
        update: Option<LlmConfigUpdate>,
    ) -> Result<(), LoadError> {
        self.manager.load_model(path.as_ref(), update.as_ref()).await
    }

    pub async fn unload_model(&self) {
        self.manager.unload_model().await
    }

    pub fn is_model_loaded(&self) -> bool {
        self.manager.is_model_loaded()
    }

    pub fn current_model_path(&self) -> Option<PathBuf> {
        self.manager.current_model_path()
    }

    pub fn state(&self) -> ModelState {
        self.manager.state()
    }

    pub fn update_config(&self, update: LlmConfigUpdate) -> LlmConfig {
        self.config.update(&update)
    }

    pub fn get_config(&self) -> LlmConfig {
        self.config.get()
    }

    /// Generates a completion for `prompt` through the active model.
    ///
    /// Holds the lifecycle lock for the whole call, so a concurrent load or
    /// unload waits for it to finish. Sampling parameters are read once, here.
    pub async fn generate_response(
        &self,
        prompt: &str,
        on_token: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<String, GenError> {
        let active = self.manager.active().await;
        let loaded = active.loaded().ok_or(GenError::NoModelLoaded)?;
        let sampling = self.config.get().sampling();
        tracing::debug!("Generating with {:?}", sampling);
        generation::generate(loaded, prompt, sampling, on_token).await
    }

    /// Channel flavour of [`LlmEngine::generate_response`].
    ///
    /// Yields incremental [`StreamToken::Token`] items followed by exactly one
    /// [`StreamToken::Done`] or [`StreamToken::Error`].
    pub fn generate_stream(self: &Arc<Self>, prompt: impl Into<String>) -> mpsc::UnboundedReceiver<StreamToken> {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(self);
        let prompt = prompt.into();

        tokio::spawn(async move {
            let token_tx = tx.clone();
            let mut forward = move |piece: &str| {
                let _ = token_tx.send(StreamToken::Token(piece.to_string()));
            };
            let last = match engine.generate_response(&prompt, Some(&mut forward)).await {
                Ok(_) => StreamToken::Done,
                Err(e) => StreamToken::Error(e.to_string()),
            };
            let _ = tx.send(last);
        });

        rx
    }

    /// Unloads the model and releases the runtime
    pub async fn dispose(&self) {
        self.manager.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::runtime::Token;
    use crate::inference::testing::{model_file, Event, MockProvider, MockScript};

    fn abc_script() -> MockScript {
        MockScript {
            prompt_batches: vec![vec![Token(0)], vec![Token(1)], vec![Token(2)]],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_generate_streams_increments() {
        let file = model_file();
        let provider = MockProvider::new(abc_script());
        let engine = LlmEngine::new(provider);
        engine.load_model(file.path(), None).await.unwrap();

        let mut fragments = Vec::new();
        let mut collect = |piece: &str| fragments.push(piece.to_string());
        let text = engine.generate_response("hi", Some(&mut collect)).await.unwrap();

        assert_eq!(text, "ABC");
        assert_eq!(fragments, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_generate_without_callback() {
        let file = model_file();
        let engine = LlmEngine::new(MockProvider::new(abc_script()));
        engine.load_model(file.path(), None).await.unwrap();

        assert_eq!(engine.generate_response("hi", None).await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn test_multi_token_batches_are_detokenized_together() {
        let file = model_file();
        let engine = LlmEngine::new(MockProvider::new(MockScript {
            prompt_batches: vec![vec![Token(7), Token(8)], vec![], vec![Token(8)]],
            ..Default::default()
        }));
        engine.load_model(file.path(), None).await.unwrap();

        let mut fragments = Vec::new();
        let mut collect = |piece: &str| fragments.push(piece.to_string());
        let text = engine.generate_response("hi", Some(&mut collect)).await.unwrap();

        assert_eq!(text, "HII");
        assert_eq!(fragments, vec!["HI", "I"]);
    }

    #[tokio::test]
    async fn test_generate_without_model() {
        let provider = MockProvider::new(abc_script());
        let engine = LlmEngine::new(provider.clone());

        let err = engine.generate_response("hi", None).await.unwrap_err();

        assert_eq!(err, GenError::NoModelLoaded);
        assert!(provider.events().is_empty());
    }

    #[tokio::test]
    async fn test_generate_after_unload() {
        let file = model_file();
        let provider = MockProvider::new(abc_script());
        let engine = LlmEngine::new(provider.clone());
        engine.load_model(file.path(), None).await.unwrap();
        engine.unload_model().await;

        let err = engine.generate_response("hi", None).await.unwrap_err();

        assert_eq!(err, GenError::NoModelLoaded);
        assert_eq!(provider.count(|e| matches!(e, Event::Prompt { .. })), 0);
    }

    #[tokio::test]
    async fn test_runtime_error_propagates_after_partial_output() {
        let file = model_file();
        let engine = LlmEngine::new(MockProvider::new(MockScript {
            prompt_batches: vec![vec![Token(0)], vec![Token(1)]],
            prompt_failure: Some("llama_decode returned -1".to_string()),
            ..Default::default()
        }));
        engine.load_model(file.path(), None).await.unwrap();

        let mut fragments = Vec::new();
        let mut collect = |piece: &str| fragments.push(piece.to_string());
        let err = engine.generate_response("hi", Some(&mut collect)).await.unwrap_err();

        assert_eq!(
            err,
            GenError::Runtime("Inference failed: llama_decode returned -1".to_string())
        );
        assert_eq!(fragments, vec!["A", "B"]);
        assert!(engine.is_model_loaded());
    }

    #[tokio::test]
    async fn test_sampling_read_at_call_start() {
        let file = model_file();
        let provider = MockProvider::new(abc_script());
        let engine = LlmEngine::new(provider.clone());
        engine.load_model(file.path(), None).await.unwrap();
        engine.update_config(LlmConfigUpdate {
            temperature: Some(0.9),
            top_k: Some(12),
            ..Default::default()
        });

        let mut bump = |_: &str| {
            engine.update_config(LlmConfigUpdate {
                temperature: Some(0.1),
                ..Default::default()
            });
        };
        engine.generate_response("hi", Some(&mut bump)).await.unwrap();

        let options = provider
            .events()
            .into_iter()
            .find_map(|e| match e {
                Event::Prompt { options, .. } => Some(options),
                _ => None,
            })
            .unwrap();
        assert!((options.sampling.temperature - 0.9).abs() < 0.001);
        assert_eq!(options.sampling.top_k, 12);
        assert!((engine.get_config().temperature - 0.1).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_load_override_keeps_sampling_fields() {
        let file = model_file();
        let engine = LlmEngine::new(MockProvider::new(MockScript::default()));
        engine.update_config(LlmConfigUpdate {
            top_p: Some(0.5),
            ..Default::default()
        });

        engine
            .load_model(
                file.path(),
                Some(LlmConfigUpdate {
                    temperature: Some(0.2),
                    context_size: Some(3000),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let config = engine.get_config();
        assert_eq!(config.context_size, 3000);
        assert!((config.temperature - 0.2).abs() < 0.001);
        assert!((config.top_p - 0.5).abs() < 0.001);
        assert_eq!(config.top_k, 40);
    }

    #[tokio::test]
    async fn test_generate_stream_ends_with_done() {
        let file = model_file();
        let engine = Arc::new(LlmEngine::new(MockProvider::new(abc_script())));
        engine.load_model(file.path(), None).await.unwrap();

        let mut rx = engine.generate_stream("hi");
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }

        assert_eq!(
            items,
            vec![
                StreamToken::Token("A".to_string()),
                StreamToken::Token("B".to_string()),
                StreamToken::Token("C".to_string()),
                StreamToken::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_stream_reports_missing_model() {
        let engine = Arc::new(LlmEngine::new(MockProvider::new(abc_script())));

        let mut rx = engine.generate_stream("hi");

        assert_eq!(
            rx.recv().await,
            Some(StreamToken::Error("No model loaded".to_string()))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dispose_then_status() {
        let file = model_file();
        let provider = MockProvider::new(abc_script());
        let engine = LlmEngine::new(provider.clone());
        engine.load_model(file.path(), None).await.unwrap();
        assert_eq!(engine.state(), ModelState::Loaded);

        engine.dispose().await;

        assert_eq!(engine.state(), ModelState::Unloaded);
        assert!(engine.current_model_path().is_none());
        assert_eq!(provider.live_models(), 0);
        assert!(matches!(
            engine.generate_response("hi", None).await,
            Err(GenError::NoModelLoaded)
        ));
    }
}

//! Scripted in-memory runtime for tests
//!
//! Records every native call so tests can check ordering, disposal counts and
//! how many handles are alive at once.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::inference::error::RuntimeError;
use crate::inference::runtime::{
    ContextParams, InferenceRuntime, ModelParams, NativeContext, NativeModel, NativeSession,
    PromptOptions, RuntimeProvider, Token,
};

type ModelFailure = Box<dyn Fn(&ModelParams) -> Option<String> + Send + Sync>;
type ContextFailure = Box<dyn Fn(i32, u32) -> Option<String> + Send + Sync>;

/// What the mock runtime should do
#[derive(Default)]
pub struct MockScript {
    pub init_failure: Option<String>,
    pub model_failure: Option<ModelFailure>,
    /// `load_model` never resolves
    pub hold_model_load: bool,
    /// Called with (gpu layers, context size)
    pub context_failure: Option<ContextFailure>,
    pub session_failure: Option<String>,
    pub context_dispose_failure: bool,
    pub model_dispose_failure: bool,
    /// Token batches every prompt delivers, in order
    pub prompt_batches: Vec<Vec<Token>>,
    /// Error returned after all batches were delivered
    pub prompt_failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Init,
    LoadModel { gpu_layers: i32 },
    CreateContext { gpu_layers: i32, context_size: u32 },
    CreateSession,
    Prompt { text: String, options: PromptOptions },
    DisposeContext,
    DisposeModel,
}

#[derive(Default)]
struct Counters {
    live_models: usize,
    max_live_models: usize,
    live_contexts: usize,
}

struct Shared {
    script: MockScript,
    events: Mutex<Vec<Event>>,
    counters: Mutex<Counters>,
}

impl Shared {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap()
    }
}

/// Provider handing out [`MockRuntime`]s that share one script and call log
#[derive(Clone)]
pub struct MockProvider {
    shared: Arc<Shared>,
}

impl MockProvider {
    pub fn new(script: MockScript) -> Self {
        Self {
            shared: Arc::new(Shared {
                script,
                events: Mutex::new(Vec::new()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().unwrap().clear();
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn live_models(&self) -> usize {
        self.shared.counters().live_models
    }

    pub fn max_live_models(&self) -> usize {
        self.shared.counters().max_live_models
    }

    pub fn live_contexts(&self) -> usize {
        self.shared.counters().live_contexts
    }
}

#[async_trait]
impl RuntimeProvider for MockProvider {
    type Runtime = MockRuntime;

    async fn init(&self) -> Result<MockRuntime, RuntimeError> {
        self.shared.record(Event::Init);
        if let Some(msg) = &self.shared.script.init_failure {
            return Err(RuntimeError::BackendInit(msg.clone()));
        }
        Ok(MockRuntime {
            shared: Arc::clone(&self.shared),
        })
    }
}

pub struct MockRuntime {
    shared: Arc<Shared>,
}

#[async_trait]
impl InferenceRuntime for MockRuntime {
    type Model = MockModel;
    type Context = MockContext;
    type Sequence = MockSequence;
    type Session = MockSession;

    async fn load_model(&self, params: ModelParams) -> Result<MockModel, RuntimeError> {
        self.shared.record(Event::LoadModel {
            gpu_layers: params.gpu_layers,
        });
        tokio::task::yield_now().await;
        if self.shared.script.hold_model_load {
            std::future::pending::<()>().await;
        }
        if let Some(msg) = self.shared.script.model_failure.as_ref().and_then(|f| f(&params)) {
            return Err(RuntimeError::ModelLoad(msg));
        }
        {
            let mut counters = self.shared.counters();
            counters.live_models += 1;
            counters.max_live_models = counters.max_live_models.max(counters.live_models);
        }
        Ok(MockModel {
            shared: Arc::clone(&self.shared),
            gpu_layers: params.gpu_layers,
        })
    }

    fn create_session(&self, _sequence: MockSequence) -> Result<MockSession, RuntimeError> {
        self.shared.record(Event::CreateSession);
        if let Some(msg) = &self.shared.script.session_failure {
            return Err(RuntimeError::Sequence(msg.clone()));
        }
        Ok(MockSession {
            shared: Arc::clone(&self.shared),
        })
    }
}

pub struct MockModel {
    shared: Arc<Shared>,
    gpu_layers: i32,
}

#[async_trait]
impl NativeModel for MockModel {
    type Context = MockContext;

    async fn create_context(&self, params: ContextParams) -> Result<MockContext, RuntimeError> {
        self.shared.record(Event::CreateContext {
            gpu_layers: self.gpu_layers,
            context_size: params.context_size,
        });
        tokio::task::yield_now().await;
        if let Some(msg) = self
            .shared
            .script
            .context_failure
            .as_ref()
            .and_then(|f| f(self.gpu_layers, params.context_size))
        {
            return Err(RuntimeError::ContextCreate(msg));
        }
        self.shared.counters().live_contexts += 1;
        Ok(MockContext {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Token `n` decodes to the n-th uppercase letter
    fn detokenize(&self, tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|t| char::from(b'A' + (t.0 as u8 % 26)))
            .collect()
    }

    async fn dispose(&mut self) -> Result<(), RuntimeError> {
        self.shared.record(Event::DisposeModel);
        {
            let mut counters = self.shared.counters();
            assert_eq!(counters.live_contexts, 0, "model disposed while a context is alive");
            counters.live_models -= 1;
        }
        if self.shared.script.model_dispose_failure {
            return Err(RuntimeError::Worker("model dispose failed".to_string()));
        }
        Ok(())
    }
}

pub struct MockContext {
    shared: Arc<Shared>,
}

pub struct MockSequence;

#[async_trait]
impl NativeContext for MockContext {
    type Sequence = MockSequence;

    fn sequence(&self) -> Result<MockSequence, RuntimeError> {
        Ok(MockSequence)
    }

    async fn dispose(&mut self) -> Result<(), RuntimeError> {
        self.shared.record(Event::DisposeContext);
        self.shared.counters().live_contexts -= 1;
        if self.shared.script.context_dispose_failure {
            return Err(RuntimeError::Worker("context dispose failed".to_string()));
        }
        Ok(())
    }
}

pub struct MockSession {
    shared: Arc<Shared>,
}

#[async_trait]
impl NativeSession for MockSession {
    async fn prompt(
        &self,
        text: &str,
        options: PromptOptions,
        on_tokens: &mut (dyn for<'t> FnMut(&'t [Token]) + Send),
    ) -> Result<(), RuntimeError> {
        self.shared.record(Event::Prompt {
            text: text.to_string(),
            options,
        });
        for batch in &self.shared.script.prompt_batches {
            on_tokens(batch);
            tokio::task::yield_now().await;
        }
        match &self.shared.script.prompt_failure {
            Some(msg) => Err(RuntimeError::Inference(msg.clone())),
            None => Ok(()),
        }
    }
}

/// An existing file to load from
pub fn model_file() -> NamedTempFile {
    tempfile::Builder::new().suffix(".gguf").tempfile().unwrap()
}

/// An existing file whose name starts with `prefix`
pub fn model_file_named(prefix: &str) -> NamedTempFile {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".gguf")
        .tempfile()
        .unwrap()
}

//! LocaLM engine CLI
//!
//! Loads a GGUF model through the strategy ladder and streams one completion
//! to stdout.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localm_engine::inference::{FatalErrorPolicy, LlamaProvider, LlmConfigUpdate, LlmEngine, StreamToken};
use localm_engine::storage::settings::{load_settings, save_settings};

#[derive(Debug, Parser)]
#[command(name = "localm-engine", version, about = "Run a local GGUF model")]
struct Cli {
    /// Path to the GGUF model file
    model: PathBuf,

    /// Prompt to complete
    prompt: String,

    /// Context window size to start the load ladder from
    #[arg(long)]
    context_size: Option<u32>,

    /// Layers to offload (-1 = all, 0 = CPU only)
    #[arg(long, allow_hyphen_values = true)]
    gpu_layers: Option<i32>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long, allow_hyphen_values = true)]
    top_k: Option<i32>,

    /// Do not fall back to CPU after a non-memory GPU failure
    #[arg(long)]
    no_cpu_fallback: bool,

    /// Store the configuration that loaded successfully as the new default
    #[arg(long)]
    save_settings: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = load_settings();

    // Initialize tracing subscriber for logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting LocaLM engine v{}", env!("CARGO_PKG_VERSION"));

    let policy = if cli.no_cpu_fallback {
        FatalErrorPolicy::Abort
    } else {
        settings.fatal_error_policy
    };
    let provider = LlamaProvider::new().quiet_native_logs(settings.quiet_native_logs);
    let engine = Arc::new(LlmEngine::with_config(provider, settings.llm).with_fatal_error_policy(policy));

    let update = LlmConfigUpdate {
        context_size: cli.context_size,
        gpu_layers: cli.gpu_layers,
        temperature: cli.temperature,
        top_p: cli.top_p,
        top_k: cli.top_k,
    };
    engine
        .load_model(&cli.model, (!update.is_empty()).then_some(update))
        .await?;

    let config = engine.get_config();
    info!(
        "Ready: context size {}, gpu layers {}",
        config.context_size, config.gpu_layers
    );
    if cli.save_settings {
        let mut saved = settings.clone();
        saved.llm = config;
        saved.fatal_error_policy = policy;
        save_settings(&saved)?;
        info!("Saved settings");
    }

    let mut stream = engine.generate_stream(cli.prompt);
    let mut stdout = std::io::stdout();
    let mut failure = None;
    while let Some(item) = stream.recv().await {
        match item {
            StreamToken::Token(text) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            StreamToken::Done => break,
            StreamToken::Error(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    writeln!(stdout)?;

    engine.dispose().await;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

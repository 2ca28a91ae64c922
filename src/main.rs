//! Shardline - run one prompt step through a locally stored model
//!
//! Usage: `shardline <model_id> <n_layers> <prompt>`

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use shardline::inference::llama::LlamaRuntime;
use shardline::storage::{init_storage, settings::load_settings};
use shardline::{EngineError, InferenceEngine, Shard, ShardInferenceEngine};

async fn run(model_id: String, n_layers: u32, prompt: String) -> Result<(), EngineError> {
    let settings = load_settings();
    let runtime = Arc::new(LlamaRuntime::start(settings.clone())?);
    let mut engine = ShardInferenceEngine::from_settings(&settings, runtime.clone(), runtime);

    engine.set_on_download_progress(Arc::new(|done: u64, total: u64| {
        info!("Loaded {}/{} layers", done, total);
    }));

    let shard = Shard::full(model_id, n_layers)?;
    let request_id = Uuid::new_v4().to_string();
    let result = engine
        .infer_prompt(&request_id, &shard, &prompt, None, None)
        .await?;

    println!(
        "{}",
        serde_json::json!({
            "request_id": request_id,
            "shard": shard,
            "output": result.output.data,
            "is_finished": result.is_finished,
        })
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("shardline=info".parse().unwrap()))
        .init();

    info!("Starting Shardline v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (model_id, n_layers, prompt) = match args.as_slice() {
        [model_id, n_layers, prompt @ ..] if !prompt.is_empty() => match n_layers.parse::<u32>() {
            Ok(n) => (model_id.clone(), n, prompt.join(" ")),
            Err(_) => {
                eprintln!("n_layers must be a positive integer, got {:?}", n_layers);
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("usage: shardline <model_id> <n_layers> <prompt>");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_storage() {
        error!("Failed to initialize storage: {}", e);
    }

    match run(model_id, n_layers, prompt).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

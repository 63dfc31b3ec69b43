//! llmodel-bridge: run local llmodel models from the command line or over
//! an OpenAI-compatible HTTP API.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use llmodel_bridge::config::{Cli, Command, Config};
use llmodel_bridge::inference::bridge::{PromptEvent, PromptRequest};
use llmodel_bridge::inference::model::LlModel;
use llmodel_bridge::metrics::BridgeMetrics;
use llmodel_bridge::server::openai_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "llmodel_bridge=debug,tower_http=debug"
    } else {
        "llmodel_bridge=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("llmodel-bridge v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(model_path) = cli.model.clone() {
        config.model.model_path = model_path;
    }
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        build_variant = config.model.build_variant,
        n_ctx = config.model.n_ctx,
        device = config.model.device,
        "Configuration loaded"
    );

    // Load the model off the async runtime; this maps the weights.
    let engine = llmodel_bridge::default_engine(config.model.library_path.as_deref());
    let model_config = config.model.clone();
    let model = Arc::new(tokio::task::spawn_blocking(move || LlModel::load(engine, &model_config)).await??);

    let result = match cli.command {
        Command::Serve { listen } => serve(model.clone(), config.clone(), listen).await,
        Command::Prompt {
            text,
            max_tokens,
            temperature,
        } => prompt(&model, &config, text, max_tokens, temperature).await,
        Command::Embed { text } => {
            let embedding = model.embed(&text)?;
            println!("{}", serde_json::to_string(&embedding)?);
            Ok(())
        }
        Command::Gpus => {
            let required = model.required_memory()?;
            let devices = model.gpu_devices()?;
            if devices.is_empty() {
                println!("No GPU device can hold this model ({required} bytes required)");
            }
            for device in devices {
                println!(
                    "{:>2}  {:<40} {:<10} {:>8} MiB{}",
                    device.index,
                    device.name,
                    device.vendor,
                    device.heap_size / (1024 * 1024),
                    if device.is_discrete() { "  discrete" } else { "" }
                );
            }
            Ok(())
        }
        Command::Info => {
            let info = serde_json::json!({
                "metadata": model.metadata(),
                "loaded": model.is_loaded(),
                "stateSize": model.state_size()?,
                "threadCount": model.thread_count()?,
                "memoryNeeded": model.required_memory()?,
                "hasGpuDevice": model.has_gpu_device()?,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    };

    model.close().await?;
    result
}

async fn serve(model: Arc<LlModel>, config: Arc<Config>, listen: Option<String>) -> anyhow::Result<()> {
    let metrics = Arc::new(BridgeMetrics::new()?);

    // Build application state.
    let state = Arc::new(AppState {
        model,
        config: config.clone(),
        metrics,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = listen.unwrap_or_else(|| config.server.listen.clone());
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

async fn prompt(
    model: &LlModel,
    config: &Config,
    text: String,
    max_tokens: Option<i32>,
    temperature: Option<f32>,
) -> anyhow::Result<()> {
    let mut options = config.generation.clone();
    if let Some(max_tokens) = max_tokens {
        options.n_predict = max_tokens;
    }
    if let Some(temperature) = temperature {
        options.temp = temperature;
    }

    let mut handle = model.prompt(PromptRequest::new(text).with_options(options))?;

    // Ctrl-C stops generation; the tokens produced so far are kept.
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling prompt");
            cancel.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    while let Some(event) = handle.next_event().await {
        match event {
            PromptEvent::Token(fragment) => {
                write!(stdout, "{fragment}")?;
                stdout.flush()?;
            }
            PromptEvent::Done(completion) => {
                writeln!(stdout)?;
                info!(
                    tokens = completion.completion_tokens,
                    finish_reason = ?completion.finish_reason,
                    "Generation finished"
                );
                break;
            }
            PromptEvent::Error(e) => return Err(e.into()),
        }
    }

    Ok(())
}

//! model-loader — загружает layers-модель, печатает смену фаз и результаты прогонов.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use model_manager::{InputSpec, ModelConfig, ModelSession, PhaseEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "model-loader", about = "Load a layers model and run predictions", version)]
struct Cli {
    /// Config file (default: ~/.model_loader/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model descriptor URL or path, e.g. /web_model/model.json.
    #[arg(long)]
    model_url: Option<String>,

    /// Directory that web-root paths resolve against.
    #[arg(long)]
    asset_root: Option<PathBuf>,

    /// Input shape including batch, e.g. 1,55,47,3.
    #[arg(long, value_delimiter = ',')]
    input_shape: Option<Vec<usize>>,

    /// Seed for the random-normal input.
    #[arg(long)]
    seed: Option<u64>,

    /// Number of predictions to run.
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// -v info, -vv debug, -vvv trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn model_config(&self) -> Result<ModelConfig> {
        let mut config = match &self.config {
            Some(path) => ModelConfig::load_from(path),
            None => ModelConfig::load(),
        }
        .context("loading config")?;
        if let Some(url) = &self.model_url {
            config.model_url = url.clone();
        }
        if let Some(root) = &self.asset_root {
            config.asset_root = root.clone();
        }
        if let Some(shape) = &self.input_shape {
            config.input_shape = shape.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.model_config()?;
    tracing::info!(model_url = %config.model_url, input_shape = ?config.input_shape, "config loaded");

    let session = ModelSession::from_config(config, InputSpec::random_normal(cli.seed))?;
    session.subscribe(Arc::new(|event: &PhaseEvent| match &event.status.error_message {
        Some(message) => eprintln!("[{}] {} -> {}: {}", event.token(), event.previous, event.phase(), message),
        None => eprintln!("[{}] {} -> {}", event.token(), event.previous, event.phase()),
    }));

    let outcome = session.load().await;
    if !outcome.is_ready() {
        let message = session
            .error_message()
            .unwrap_or_else(|| format!("{outcome:?}"));
        bail!(message);
    }

    for run in 1..=cli.runs {
        let result = session
            .run()
            .await
            .with_context(|| format!("run {run} produced no result"))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    let memory = session.memory();
    tracing::info!(tensors = memory.num_tensors, bytes = memory.num_bytes, "memory before dispose");
    session.dispose().await;
    Ok(())
}

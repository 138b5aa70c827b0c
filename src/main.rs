use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mask_overlay::{Config, ImageProcessor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let model_path = config.model_path();
    ensure!(
        model_path.exists(),
        "Model path does not exist: {}",
        model_path.display()
    );
    ensure!(config.input.exists(), "Input path does not exist");

    let mut processor = ImageProcessor::with_onnx_model(config.clone())
        .with_context(|| format!("Failed to load model: {}", model_path.display()))?;

    if let Some(model) = processor.segmenter().model() {
        if let Some(requested) = model.fallback_from() {
            tracing::warn!(
                "delegate {} is unavailable, running on {}",
                requested,
                model.delegate()
            );
        }
    }

    let processed = processor.process().await;
    processor.shutdown().await;
    let processed = processed?;

    tracing::info!("wrote {} image(s) to {}", processed, config.output_dir.display());
    Ok(())
}

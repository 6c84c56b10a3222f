use std::error::Error as StdError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use latentedit::{load_pipeline, ort, server, EditConfig, EditService};
use tracing_subscriber::EnvFilter;

/// Serve a pretrained image-editing pipeline behind a web form
#[derive(Debug, Parser)]
#[command(name = "latentedit", version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Local checkpoint directory or hub repository id
    #[arg(long)]
    model: Option<String>,

    /// Square output resolution, must be a multiple of 14
    #[arg(long)]
    resolution: Option<u32>,

    /// Number of denoising steps
    #[arg(long)]
    steps: Option<usize>,
}

impl Cli {
    fn into_config(self) -> Result<EditConfig, Box<dyn StdError>> {
        let mut config = match &self.config {
            Some(path) => EditConfig::open(path)?,
            None => EditConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(model) = self.model {
            config.model_id = model;
        }
        if let Some(resolution) = self.resolution {
            config.resolution = resolution;
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn StdError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;

    let env = ort::Environment::builder()
        .with_name("latentedit")
        .with_log_level(ort::LoggingLevel::Warning)
        .build()?
        .into();
    let pipeline = load_pipeline(env, &config)?;

    let service = EditService::from_config(pipeline, &config);
    service.prepare()?;

    let router = server::router(Arc::new(service), &config);
    server::serve(router, config.bind).await?;
    Ok(())
}

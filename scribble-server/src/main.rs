use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hf_hub::api::tokio::Api;
use scribble_core::{
    ComputeTarget, DeviceMap, ModelCache, ModelRepos, SamplingDefaults, SketchService,
};
use scribble_server::{build_router, AppState, RouterOptions};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Scribble sketch-to-image server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "SCRIBBLE_CPU")]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, env = "SCRIBBLE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "SCRIBBLE_PORT", default_value_t = 8000)]
    port: u16,

    /// Stable Diffusion 1.5 repository (UNet, VAE, text encoder)
    #[arg(long, env = "SCRIBBLE_BASE_MODEL", default_value = "stable-diffusion-v1-5/stable-diffusion-v1-5")]
    base_model: String,

    /// Scribble ControlNet repository
    #[arg(long, env = "SCRIBBLE_CONTROLNET_MODEL", default_value = "lllyasviel/control_v11p_sd15_scribble")]
    controlnet_model: String,

    /// Repository holding the HED annotator weights
    #[arg(long, env = "SCRIBBLE_ANNOTATOR_MODEL", default_value = "lllyasviel/Annotators")]
    annotator_model: String,

    /// Repository providing the CLIP tokenizer.json
    #[arg(long, env = "SCRIBBLE_TOKENIZER_MODEL", default_value = "openai/clip-vit-base-patch32")]
    tokenizer_model: String,

    /// Denoising steps when a request does not set them
    #[arg(long, env = "SCRIBBLE_STEPS", default_value_t = 20)]
    steps: usize,

    /// Classifier-free guidance scale when a request does not set it
    #[arg(long, env = "SCRIBBLE_GUIDANCE_SCALE", default_value_t = 7.5)]
    guidance_scale: f64,

    /// Origin allowed to call the API from a browser (repeatable)
    #[arg(
        long = "allowed-origin",
        env = "SCRIBBLE_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values_t = ["http://localhost:5173".to_string(), "http://localhost:3000".to_string()]
    )]
    allowed_origins: Vec<String>,

    /// Largest accepted upload, in bytes
    #[arg(long, env = "SCRIBBLE_MAX_UPLOAD_BYTES", default_value_t = 20 * 1024 * 1024)]
    max_upload_bytes: usize,

    /// Start loading the models in the background right away
    #[arg(long, env = "SCRIBBLE_WARMUP")]
    warmup: bool,
}

impl Args {
    fn repos(&self) -> ModelRepos {
        ModelRepos {
            base: self.base_model.clone(),
            controlnet: self.controlnet_model.clone(),
            annotator: self.annotator_model.clone(),
            tokenizer: self.tokenizer_model.clone(),
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let target = ComputeTarget::resolve(device_map)?;
    tracing::info!(device = target.kind.label(), dtype = ?target.dtype, "compute target resolved");

    let cache = Arc::new(ModelCache::from_hub(target, Api::new()?, args.repos()));
    let defaults = SamplingDefaults {
        steps: args.steps,
        guidance_scale: args.guidance_scale,
    };
    let service = Arc::new(SketchService::new(cache, defaults));

    if args.warmup {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(err) = service.warm_up().await {
                tracing::error!(error = %err, "warm-up failed, models will load on first request");
            }
        });
    } else {
        tracing::info!("models will load on first generation request");
    }

    let options = RouterOptions {
        allowed_origins: args.allowed_origins.clone(),
        max_upload_bytes: args.max_upload_bytes,
    };
    let app = build_router(AppState::new(service), &options)?;

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(addr = %listener.local_addr()?, "server ready");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

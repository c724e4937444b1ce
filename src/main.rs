//! pathstream server - progressive path-traced frames over WebSocket.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pathstream::logging;
use pathstream::render::{environment, CpuBackend, RenderBackend, RenderInvoker};
use pathstream::settings::{BackendKind, Settings};
use pathstream::stream::Server;

#[derive(Debug, Parser)]
#[command(name = "pathstream", version, about)]
struct Args {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the settings file and continue
    #[arg(long)]
    save_config: bool,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Frame width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Frame height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Samples per pixel rendered per tick
    #[arg(long)]
    samples_per_tick: Option<u32>,

    /// Equirectangular environment map (.hdr / .exr)
    #[arg(long)]
    env_map: Option<PathBuf>,

    /// Render with the software backend
    #[arg(long)]
    cpu: bool,

    /// Seed for the per-pixel random streams
    #[arg(long)]
    seed: Option<u64>,

    /// JPEG quality (1-100)
    #[arg(long)]
    quality: Option<u8>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.host {
            settings.host = v.clone();
        }
        if let Some(v) = self.port {
            settings.port = v;
        }
        if let Some(v) = self.width {
            settings.width = v;
        }
        if let Some(v) = self.height {
            settings.height = v;
        }
        if let Some(v) = self.samples_per_tick {
            settings.samples_per_tick = v;
        }
        if let Some(v) = &self.env_map {
            settings.environment_map = Some(v.clone());
        }
        if self.cpu {
            settings.backend = BackendKind::Cpu;
        }
        if let Some(v) = self.seed {
            settings.seed = v;
        }
        if let Some(v) = self.quality {
            settings.jpeg_quality = v;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref());
    args.apply(&mut settings);

    let _log = logging::init_tracing(&logging::verbosity_filter(&settings.log_filter, args.verbose));
    settings.validate().context("invalid settings")?;

    if args.save_config {
        let path = args
            .config
            .clone()
            .or_else(Settings::default_path)
            .context("no settings location available")?;
        settings.save(&path)?;
        tracing::info!(path = %path.display(), "settings saved");
    }

    let env = environment::load_or_default(settings.environment_map.as_deref())?;
    let backend = create_backend(settings.backend).await;
    let invoker = RenderInvoker::new(backend, env, settings.width, settings.height, settings.seed);

    Server::bind(&settings, invoker)
        .await
        .with_context(|| format!("cannot serve on {}", settings.address()))?
        .run()
        .await?;
    Ok(())
}

#[cfg(feature = "gpu")]
async fn create_backend(kind: BackendKind) -> Box<dyn RenderBackend> {
    if kind == BackendKind::Gpu {
        match pathstream::render::WgpuBackend::new().await {
            Ok(gpu) => {
                tracing::info!(adapter = gpu.adapter_name(), "rendering on GPU");
                return Box::new(gpu);
            }
            Err(e) => tracing::warn!(error = %e, "no usable GPU, falling back to software rendering"),
        }
    }
    Box::new(CpuBackend::new())
}

#[cfg(not(feature = "gpu"))]
async fn create_backend(kind: BackendKind) -> Box<dyn RenderBackend> {
    if kind == BackendKind::Gpu {
        tracing::warn!("built without the gpu feature, using software rendering");
    }
    Box::new(CpuBackend::new())
}

use std::path::PathBuf;

use burn::{backend::NdArray, prelude::*};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use burn_vit::{
    correctness::{self, CorrectnessReference},
    model::vit::{Pool, ViTConfig},
};

type ToolBackend = NdArray<f32>;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Tiny,
    Small,
    Base,
    Large,
}

/// Build a vision transformer and run one forward pass.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config written by `ViTConfig::save`; overrides the preset.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "tiny")]
    preset: Preset,

    #[arg(long)]
    image_size: Option<usize>,

    #[arg(long)]
    patch_size: Option<usize>,

    #[arg(long, default_value_t = 0)]
    num_classes: usize,

    /// `cls` or `mean`.
    #[arg(long, default_value = "cls")]
    pool: String,

    /// Checkpoint saved with the named mpk recorder.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Safetensors file with `network_input` and `output` to compare against.
    #[arg(long)]
    reference: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Write the effective config next to the run.
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl Args {
    fn vit_config(&self) -> burn_vit::Result<ViTConfig> {
        if let Some(path) = &self.config {
            return ViTConfig::load(path).map_err(|err| {
                burn_vit::VitError::InvalidConfig(format!("{}: {err}", path.display()))
            });
        }

        let (image_size, patch_size, num_classes) =
            (self.image_size, self.patch_size, self.num_classes);
        let config = match self.preset {
            Preset::Tiny => ViTConfig::tiny(image_size, patch_size, num_classes),
            Preset::Small => ViTConfig::small(image_size, patch_size, num_classes),
            Preset::Base => ViTConfig::base(image_size, patch_size, num_classes),
            Preset::Large => ViTConfig::large(image_size, patch_size, num_classes),
        };

        Ok(config.with_pool(self.pool.parse::<Pool>()?))
    }
}

fn main() -> burn_vit::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("burn_vit=info")),
        )
        .init();

    let args = Args::parse();
    let device = Default::default();
    let config = args.vit_config()?;

    if let Some(path) = &args.save_config {
        config.save(path)?;
    }

    let model = match &args.checkpoint {
        Some(path) => correctness::load_model_from_checkpoint::<ToolBackend>(&config, path, &device)?,
        None => config.init::<ToolBackend>(&device)?,
    };
    tracing::info!(
        num_patches = model.num_patches(),
        parameters = model.num_params(),
        "model ready"
    );

    if let Some(path) = &args.reference {
        let reference = CorrectnessReference::load(path)?;
        let stats = correctness::run_correctness(&model, &reference, &device)?;
        tracing::info!(
            mean_abs = stats.mean_abs,
            max_abs = stats.max_abs,
            max_rel = stats.max_rel,
            mse = stats.mse,
            within_defaults = stats.within_defaults(),
            "reference comparison"
        );
        return Ok(());
    }

    let input = Tensor::<ToolBackend, 4>::zeros(
        [
            args.batch_size,
            config.channels,
            config.image_size[0],
            config.image_size[1],
        ],
        &device,
    );
    let output = model.forward(input)?;
    tracing::info!(shape = ?output.dims(), "forward complete");

    Ok(())
}

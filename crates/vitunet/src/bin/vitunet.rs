use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burn::config::Config;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use vitunet::{
    backend::{create_device, get_backend_name, SelectedBackend},
    model::{InputShape, InterpolationStrategy, ModelConfig, RefineStage},
    report::{run_forward, summarize},
};

/// Stack reserved for building and running the model.
const STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "vitunet")]
#[command(about = "Double ViT-UNet: two-stage segmentation with a VGG U-Net and a transformer U-Net")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the model and print its structure, parameter count and shape plan
    Summary(ModelArgs),

    /// Validate a configuration and print the shape plan without allocating weights
    Plan(ModelArgs),

    /// Run one forward pass on a random batch
    Forward {
        #[command(flatten)]
        model: ModelArgs,

        /// Batch size of the random input
        #[arg(short, long, default_value_t = 1)]
        batch: usize,
    },

    /// Write the model configuration as JSON
    Config {
        #[command(flatten)]
        model: ModelArgs,

        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show backend information
    Info,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RefineArg {
    Vit,
    Conv,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InterpolationArg {
    Bilinear,
    Nearest,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Image height, a multiple of 16 and of the patch size
    #[arg(long, default_value_t = 192)]
    height: usize,

    /// Image width, a multiple of 16 and of the patch size
    #[arg(long, default_value_t = 256)]
    width: usize,

    /// Image channels
    #[arg(long, default_value_t = 3)]
    channels: usize,

    /// Second-stage network
    #[arg(long, value_enum, default_value_t = RefineArg::Vit)]
    refine: RefineArg,

    /// Upsampling mode
    #[arg(long, value_enum, default_value_t = InterpolationArg::Bilinear)]
    interpolation: InterpolationArg,

    /// JSON model configuration; overrides every other model option
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl ModelArgs {
    fn model_config(&self) -> Result<ModelConfig> {
        if let Some(path) = &self.config {
            return ModelConfig::load(path)
                .map_err(|err| anyhow::anyhow!("{err}"))
                .with_context(|| format!("failed to load model config {}", path.display()));
        }

        let refine = match self.refine {
            RefineArg::Vit => RefineStage::Vit,
            RefineArg::Conv => RefineStage::Conv,
        };
        let interpolation = match self.interpolation {
            InterpolationArg::Bilinear => InterpolationStrategy::Bilinear,
            InterpolationArg::Nearest => InterpolationStrategy::Nearest,
        };

        Ok(ModelConfig::new(
            InputShape::new(self.height, self.width).with_channels(self.channels),
            interpolation,
        )
        .with_refine(refine))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let device = create_device();
    tracing::debug!(backend = get_backend_name(), "selected backend");

    match cli.command {
        Commands::Summary(args) => {
            let config = args.model_config()?;
            let summary =
                stacker::grow(STACK_SIZE, || summarize::<SelectedBackend>(&config, &device))?;
            println!("{summary}");
            Ok(())
        }

        Commands::Plan(args) => {
            let plan = args.model_config()?.plan()?;
            println!("{plan}");
            Ok(())
        }

        Commands::Forward { model, batch } => {
            if batch == 0 {
                bail!("batch size must be positive");
            }
            let config = model.model_config()?;
            let report = stacker::grow(STACK_SIZE, || {
                run_forward::<SelectedBackend>(&config, batch, &device)
            })?;

            println!("coarse:  {}", report.coarse);
            println!("refined: {}", report.refined);
            if !report.refined.is_probability() {
                bail!("refined mask left [0, 1]: {}", report.refined);
            }
            Ok(())
        }

        Commands::Config { model, output } => {
            let config = model.model_config()?;
            // Reject configurations that cannot be built before writing them.
            config.plan()?;
            config
                .save(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            tracing::info!(path = %output.display(), "wrote model configuration");
            Ok(())
        }

        Commands::Info => {
            println!("Double ViT-UNet Information:");
            println!("  Backend: {}", get_backend_name());
            println!("  Device: {device:?}");
            Ok(())
        }
    }
}

//! CLI entry point for ncalab-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ncalab_rs::data::{disc_target, growing_dataset, TensorDataLoader};
use ncalab_rs::models::{GrowingNca, NcaModel, NcaSettings};
use ncalab_rs::summary_writer::{JsonlSummaryWriter, SummaryWriter};
use ncalab_rs::utils::get_compute_device;
use ncalab_rs::{ReplayPool, Result, Trainer, TrainerConfig};

#[derive(Parser)]
#[command(name = "ncalab")]
#[command(about = "Train Neural Cellular Automata")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a trainer configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Write the default trainer configuration
    Init {
        /// Output path for config file
        #[arg(default_value = "trainer.yaml")]
        output: PathBuf,
    },
    /// Train a growing NCA on a generated disc image
    Grow {
        /// Trainer configuration (defaults if omitted)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to save the weights
        #[arg(long, default_value = "weights/ncalab_growing_disc.safetensors")]
        output: PathBuf,
        /// Side length of the target image
        #[arg(long, default_value_t = 40)]
        size: usize,
        /// Hidden channels of the NCA
        #[arg(short = 'H', long, default_value_t = 12)]
        hidden_channels: usize,
        /// Minibatch size
        #[arg(short, long, default_value_t = 8)]
        batch_size: usize,
        /// Override max_epochs from the configuration
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Plot interval in epochs
        #[arg(long, default_value_t = 100)]
        save_every: usize,
        /// Compute device (cpu, cuda, cuda:N)
        #[arg(long, default_value = "cpu")]
        device: String,
        /// Directory for JSONL summaries and figures
        #[arg(long)]
        summary_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = TrainerConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Optimizer: {}", config.optimizer_method);
            println!("  Learning rate: {}", config.learning_rate());
            println!("  Steps: {:?}", config.steps_range);
            println!("  Max epochs: {}", config.max_epochs);
        }
        Commands::Init { output } => {
            TrainerConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Grow {
            config,
            output,
            size,
            hidden_channels,
            batch_size,
            epochs,
            save_every,
            device,
            summary_dir,
        } => {
            let mut config = match config {
                Some(path) => TrainerConfig::from_file(path)?,
                None => TrainerConfig::default(),
            };
            if let Some(epochs) = epochs {
                config.max_epochs = epochs;
            }
            let device = get_compute_device(&device)?;

            let model = GrowingNca::new(NcaSettings::growing(4, hidden_channels), &device)?;
            let target = disc_target(size, [0.9, 0.45, 0.1], &device)?;
            let (seeds, targets) =
                growing_dataset(&target, model.num_channels(), batch_size, &device)?;
            let loader = TensorDataLoader::new(seeds, targets, batch_size)?;

            let mut trainer = Trainer::new(model, Some(output.clone()), config)?
                .with_pool(ReplayPool::new(6, true)?);
            let mut writer = summary_dir.map(JsonlSummaryWriter::create).transpose()?;

            let summary = trainer.train(
                &loader,
                None,
                None,
                Some(save_every),
                writer.as_mut().map(|w| w as &mut dyn SummaryWriter),
                None,
                None,
            )?;

            let summary_path = output.with_extension("summary.json");
            std::fs::write(&summary_path, summary.to_json()?)?;
            println!("{summary}");
            println!("✓ Summary written to: {}", summary_path.display());
        }
    }

    Ok(())
}

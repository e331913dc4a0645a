//! # ncalab-rs
//!
//! Training infrastructure for Neural Cellular Automata (NCA) on top of
//! candle.
//!
//! An NCA repeatedly applies a small learned update rule to every cell of a
//! (B, C, H, W) state tensor. This crate provides the machinery to train
//! such models:
//!
//! - **Trainer** - randomized unroll lengths, optimizer and learning rate
//!   schedule, checkpointing, validation, best-model tracking and a final
//!   test evaluation, summarized in a [`TrainingSummary`]
//! - **ReplayPool** - feeds past outputs (optionally damaged) back in as
//!   starting states
//! - **CascadeNca** - coarse-to-fine inference over several resolutions
//! - **EarlyStopping** - stops training once validation stagnates
//! - **Models** - growing and segmentation NCAs sharing one update rule
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a default training configuration
//! ncalab init trainer.yaml
//!
//! # Check a configuration
//! ncalab validate trainer.yaml
//!
//! # Grow a disc from a single seed cell
//! ncalab grow --config trainer.yaml --output weights/growing.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use candle_core::Device;
//! use ncalab_rs::data::{disc_target, growing_dataset, TensorDataLoader};
//! use ncalab_rs::models::{GrowingNca, NcaSettings};
//! use ncalab_rs::{ReplayPool, Trainer, TrainerConfig};
//!
//! # fn main() -> ncalab_rs::Result<()> {
//! let device = Device::Cpu;
//! let model = GrowingNca::new(NcaSettings::growing(4, 12), &device)?;
//!
//! let target = disc_target(32, [0.9, 0.4, 0.1], &device)?;
//! let (seeds, targets) = growing_dataset(&target, 16, 8, &device)?;
//! let loader = TensorDataLoader::new(seeds, targets, 8)?;
//!
//! let mut trainer = Trainer::new(model, Some("growing.safetensors".into()), TrainerConfig::default())?
//!     .with_pool(ReplayPool::new(6, true)?);
//! let summary = trainer.train(&loader, None, None, Some(100), None, None, None)?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::module_name_repetitions
)]

pub mod cascade;
pub mod config;
pub mod data;
pub mod early_stopping;
pub mod error;
pub mod models;
pub mod optimizer;
pub mod pool;
pub mod scheduler;
pub mod summary;
pub mod summary_writer;
pub mod trainer;
pub mod utils;

pub use cascade::CascadeNca;
pub use config::{OptimizerMethod, TrainerConfig};
pub use early_stopping::{EarlyStopping, StoppingDecision, StoppingMode};
pub use error::{NcaError, Result};
pub use models::NcaModel;
pub use pool::ReplayPool;
pub use summary::TrainingSummary;
pub use summary_writer::{JsonlSummaryWriter, SummaryWriter};
pub use trainer::Trainer;

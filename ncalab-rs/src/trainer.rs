//! Training loop.
//!
//! [`Trainer`] owns the model, an optional [`ReplayPool`] and a seeded random
//! number generator. [`Trainer::train`] runs the complete schedule: per-batch
//! randomized unroll lengths, optimizer and scheduler steps, pool updates,
//! per-epoch checkpointing and validation, best-model tracking, early
//! stopping and a final evaluation on the test set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::TrainerConfig;
use crate::data::DataLoader;
use crate::early_stopping::EarlyStopping;
use crate::error::{NcaError, Result};
use crate::models::{scalar, LossMap, Metrics, NcaModel, TOTAL_LOSS};
use crate::optimizer::{clip_grad_norm, NcaOptimizer, OptimizerConfig};
use crate::pool::ReplayPool;
use crate::scheduler::LRScheduler;
use crate::summary::TrainingSummary;
use crate::summary_writer::{Figure, SummaryWriter};
use crate::utils::{
    best_checkpoint_path, fix_random_seed, pad_input, repeat_batch, save_checkpoint,
};

/// Maximum global gradient norm when clipping is enabled.
const MAX_GRAD_NORM: f64 = 1.0;

/// Batch progress is only shown for loaders with more batches than this.
const MIN_BATCHES_FOR_PROGRESS: usize = 3;

/// Renders the last training batch of an epoch: input, prediction, target
/// and the model.
pub type PlotFunction<'a, M> = dyn Fn(&Tensor, &Tensor, &Tensor, &M) -> Result<Figure> + 'a;

/// Trains an [`NcaModel`].
pub struct Trainer<M: NcaModel> {
    model: M,
    model_path: Option<PathBuf>,
    config: TrainerConfig,
    pool: Option<ReplayPool>,
    rng: ChaCha8Rng,
}

impl<M: NcaModel> Trainer<M> {
    /// Create a trainer.
    ///
    /// When `model_path` is set, weights are written there after every epoch
    /// and the best model to the derived `.best` path.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] if the configuration is invalid.
    pub fn new(model: M, model_path: Option<PathBuf>, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let rng = fix_random_seed(config.seed);
        Ok(Self {
            model,
            model_path,
            config,
            pool: None,
            rng,
        })
    }

    /// Attach a replay pool (builder pattern).
    ///
    /// Damage is kept off the model's immutable channels.
    #[must_use]
    pub fn with_pool(mut self, pool: ReplayPool) -> Self {
        let protected = pool
            .protected_channels()
            .max(self.model.num_immutable_channels());
        self.pool = Some(pool.with_protected_channels(protected));
        self
    }

    /// The attached pool, if any.
    pub fn pool(&self) -> Option<&ReplayPool> {
        self.pool.as_ref()
    }

    /// Detach and return the pool.
    pub fn take_pool(&mut self) -> Option<ReplayPool> {
        self.pool.take()
    }

    /// The model being trained.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the model being trained.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Consume the trainer, returning the model in its final state.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Training configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Where weights are saved, if anywhere.
    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// Markdown overview of the training parameters.
    pub fn info(&self) -> String {
        let model_path = self
            .model_path
            .as_ref()
            .map_or_else(|| "None".to_string(), |p| p.display().to_string());
        let c = &self.config;
        let mut s = String::from("Trainer Info\n-------------------\n");
        for (name, value) in [
            ("Model Path", model_path),
            ("Lr", c.learning_rate().to_string()),
            ("Lr Gamma", c.lr_gamma.to_string()),
            ("Gradient Clipping", c.gradient_clipping.to_string()),
            ("Adam Betas", format!("{:?}", c.adam_betas)),
            ("Batch Repeat", c.batch_repeat.to_string()),
            ("Max Epochs", c.max_epochs.to_string()),
            ("Optimizer Method", c.optimizer_method.to_string()),
        ] {
            s.push_str(&format!("**{name}:** {value}\n"));
        }
        s
    }

    /// Run one optimization step on an already prepared batch.
    ///
    /// Unrolls the model for exactly `steps` steps, backpropagates the
    /// `"total"` loss, optionally clips the gradient norm, then steps the
    /// optimizer and the scheduler. Loss terms are reported as
    /// `Loss/train_{name}` at `total_batch_iterations`.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::NumericInstability`] if the total loss is not
    /// finite; any tensor error propagates.
    #[allow(clippy::too_many_arguments)]
    pub fn train_iteration(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        steps: usize,
        optimizer: &mut NcaOptimizer,
        scheduler: &mut LRScheduler,
        total_batch_iterations: usize,
        summary_writer: Option<&mut (dyn SummaryWriter + '_)>,
    ) -> Result<(Tensor, LossMap)> {
        self.model.set_training(true);
        let prediction = self.model.forward(x, steps)?;
        let losses = self.model.loss(&prediction, y)?;
        let total = total_loss(&losses)?;
        let value = scalar(total)?;
        if !value.is_finite() {
            return Err(NcaError::NumericInstability(format!(
                "total loss is {value} at batch iteration {total_batch_iterations}"
            )));
        }

        let mut grads = total.backward()?;
        if self.config.gradient_clipping {
            let vars = self.model.varmap().all_vars();
            let norm = clip_grad_norm(&vars, &mut grads, MAX_GRAD_NORM)?;
            tracing::trace!("Gradient norm before clipping: {:.5}", norm);
        }
        optimizer.step(&grads)?;
        scheduler.step(optimizer);

        if let Some(writer) = summary_writer {
            for (name, loss) in &losses {
                writer.add_scalar(
                    &format!("Loss/train_{name}"),
                    scalar(loss)?,
                    total_batch_iterations,
                )?;
            }
        }
        Ok((prediction, losses))
    }

    /// Run the full training schedule.
    ///
    /// * `save_every` - Plot interval in epochs (default 1)
    /// * `summary_writer` - Receives losses, validation metrics and figures
    /// * `plot_function` - Renders the last training batch instead of
    ///   [`NcaModel::plot`]; figures are only produced with a summary writer
    /// * `earlystopping` - Fed the validation metric once per epoch
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] if `save_every` is zero or the training
    /// loader is empty. Any failure inside an epoch aborts training.
    #[allow(clippy::too_many_arguments)]
    pub fn train(
        &mut self,
        train_loader: &dyn DataLoader,
        val_loader: Option<&dyn DataLoader>,
        test_loader: Option<&dyn DataLoader>,
        save_every: Option<usize>,
        mut summary_writer: Option<&mut (dyn SummaryWriter + '_)>,
        plot_function: Option<&PlotFunction<'_, M>>,
        mut earlystopping: Option<&mut EarlyStopping>,
    ) -> Result<TrainingSummary> {
        let save_every = save_every.unwrap_or(1);
        if save_every == 0 {
            return Err(NcaError::config("save_every must be > 0"));
        }
        if train_loader.is_empty() {
            return Err(NcaError::config("training data loader is empty"));
        }

        if let Some(writer) = summary_writer.as_deref_mut() {
            writer.add_text("Training Info", &self.info())?;
        }

        let lr = self.config.learning_rate();
        let mut optimizer = OptimizerConfig {
            method: self.config.optimizer_method,
            learning_rate: lr,
            betas: self.config.adam_betas,
        }
        .build(self.model.varmap())?;
        let mut scheduler = LRScheduler::exponential(lr, self.config.lr_gamma);

        let best_path = self.model_path.as_deref().map(best_checkpoint_path);
        let mut best_acc = 0.0;
        let mut best_training_loss = f64::INFINITY;
        let mut best_model: Option<M> = None;
        let mut total_batch_iterations = 0usize;

        tracing::info!("Starting training");
        tracing::info!("  Optimizer: {} (lr {:.2e})", optimizer.method(), lr);
        tracing::info!("  Epochs: {}", self.config.max_epochs);
        tracing::info!("  Batches per epoch: {}", train_loader.len());

        let epoch_bar = ProgressBar::new(self.config.max_epochs as u64);
        epoch_bar.set_style(
            ProgressStyle::default_bar()
                .template("Epochs  [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>5}/{len:5} {msg}")?
                .progress_chars("#>-"),
        );
        let batch_style = ProgressStyle::default_bar()
            .template("Batches [{elapsed_precise}] [{wide_bar:.green/white}] {pos:>5}/{len:5} {msg}")?
            .progress_chars("#>-");

        let (steps_lo, steps_hi) = self.config.steps_range;
        for epoch in 0..self.config.max_epochs {
            if earlystopping.as_deref().is_some_and(EarlyStopping::done) {
                tracing::info!("Early stopping before epoch {}", epoch);
                break;
            }
            self.model.set_training(true);

            let batch_bar = (train_loader.len() > MIN_BATCHES_FOR_PROGRESS).then(|| {
                let bar = ProgressBar::new(train_loader.len() as u64);
                bar.set_style(batch_style.clone());
                bar
            });

            let mut epoch_losses = Vec::with_capacity(train_loader.len());
            let mut last_batch = None;
            for batch in train_loader.iter() {
                let (x, y) = batch?;
                let (x, y) = prepare_batch(&self.model, &mut self.rng, &x, &y)?;
                let x = match &self.pool {
                    Some(pool) => pool.sample(&x, &mut self.rng)?,
                    None => x,
                };
                let x = repeat_batch(&x, self.config.batch_repeat)?;
                let y = repeat_batch(&y, self.config.batch_repeat)?;

                let steps = self.rng.gen_range(steps_lo..steps_hi);
                let (prediction, losses) = self.train_iteration(
                    &x,
                    &y,
                    steps,
                    &mut optimizer,
                    &mut scheduler,
                    total_batch_iterations,
                    summary_writer.as_deref_mut(),
                )?;
                total_batch_iterations += 1;

                let prediction = prediction.detach();
                if let Some(pool) = &mut self.pool {
                    pool.update(&prediction);
                }
                let loss = scalar(total_loss(&losses)?)?;
                epoch_losses.push(loss);
                if let Some(bar) = &batch_bar {
                    bar.set_message(format!("loss {loss:.5}"));
                    bar.inc(1);
                }
                last_batch = Some((x, prediction, y));
            }
            if let Some(bar) = batch_bar {
                bar.finish_and_clear();
            }

            if epoch_losses.is_empty() {
                return Err(NcaError::config("training data loader yielded no batches"));
            }
            let mean_loss = epoch_losses.iter().sum::<f64>() / epoch_losses.len() as f64;
            best_training_loss = best_training_loss.min(mean_loss);
            tracing::debug!("Epoch {}: mean training loss {:.5}", epoch, mean_loss);

            if (epoch + 1) % save_every == 0 {
                if let (Some(writer), Some((x, prediction, y))) =
                    (summary_writer.as_deref_mut(), &last_batch)
                {
                    let figure = match plot_function {
                        Some(plot) => plot(x, prediction, y, &self.model)?,
                        None => self.model.plot(x, prediction, y)?,
                    };
                    writer.add_figure("Training Batch", &figure, epoch)?;
                }
            }

            self.model.set_training(false);
            if let Some(path) = &self.model_path {
                save_checkpoint(self.model.varmap(), path)?;
            }

            if let Some(val_loader) = val_loader {
                let mut averager = MetricAverager::default();
                for batch in val_loader.iter() {
                    let (x, y) = batch?;
                    let (x, y) = prepare_batch(&self.model, &mut self.rng, &x, &y)?;
                    let validation = self.model.validate(&x, &y, self.config.steps_validation)?;
                    averager.add(&validation.metrics);
                }
                let metrics = averager.finish();
                if let Some(writer) = summary_writer.as_deref_mut() {
                    for (name, value) in &metrics {
                        writer.add_scalar(&format!("Acc/Val/{name}"), *value, epoch)?;
                    }
                }

                if let Some(&val_acc) = metrics.get(self.model.validation_metric()) {
                    if val_acc > best_acc {
                        tracing::info!("Accuracy improvement: {:.5} --> {:.5}", best_acc, val_acc);
                        tracing::info!("  In Epoch {}", epoch);
                        if let Some(path) = &best_path {
                            save_checkpoint(self.model.varmap(), path)?;
                        }
                        best_acc = val_acc;
                        best_model = Some(self.model.try_clone()?);
                    }
                    if let Some(early_stop) = earlystopping.as_deref_mut() {
                        early_stop.step(val_acc);
                    }
                }
            }

            epoch_bar.set_message(format!("loss {mean_loss:.5}, best acc {best_acc:.5}"));
            epoch_bar.inc(1);
        }
        epoch_bar.finish();

        let mut test_metrics = Metrics::new();
        if let Some(test_loader) = test_loader {
            let evaluator = best_model.as_mut().unwrap_or(&mut self.model);
            evaluator.set_training(false);
            let mut averager = MetricAverager::default();
            for batch in test_loader.iter() {
                let (x, y) = batch?;
                let (x, y) = prepare_batch(evaluator, &mut self.rng, &x, &y)?;
                averager.add(&evaluator.metrics(&x, &y)?);
            }
            test_metrics = averager.finish();
        }

        tracing::info!(
            "Training finished: best training loss {:.5}, best validation accuracy {:.5}",
            best_training_loss,
            best_acc
        );
        Ok(TrainingSummary::new(
            best_acc,
            best_path,
            best_training_loss,
            test_metrics,
        ))
    }
}

fn total_loss(losses: &LossMap) -> Result<&Tensor> {
    losses
        .get(TOTAL_LOSS)
        .ok_or_else(|| NcaError::Config(format!("loss map has no '{TOTAL_LOSS}' entry")))
}

/// Move a raw batch to the model's device, pad it to the model's channel
/// count and apply the model's input preparation.
fn prepare_batch<M: NcaModel>(
    model: &M,
    rng: &mut ChaCha8Rng,
    x: &Tensor,
    y: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let x = x.to_device(model.device())?;
    let y = y.to_device(model.device())?;
    let x = pad_input(&x, model.num_channels(), model.pad_noise(), rng)?;
    Ok((model.prepare_input(&x)?, y))
}

/// Per-name running mean over batches.
#[derive(Default)]
struct MetricAverager {
    sums: BTreeMap<String, (f64, usize)>,
}

impl MetricAverager {
    fn add(&mut self, metrics: &Metrics) {
        for (name, value) in metrics {
            let entry = self.sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    fn finish(self) -> Metrics {
        self.sums
            .into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f64))
            .collect()
    }
}

//! The model contract consumed by the trainer, and the concrete NCA flavors.
//!
//! Every trainable model implements [`NcaModel`]. The trainer and
//! [`CascadeNca`](crate::cascade::CascadeNca) are generic over it, so a new
//! flavor only has to implement the trait.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::Result;
use crate::summary_writer::Figure;

pub mod growing;
pub mod rule;
pub mod segmentation;

pub use growing::GrowingNca;
pub use rule::{NcaSettings, UpdateRule};
pub use segmentation::SegmentationNca;

/// Named scalar loss terms. Always contains a `"total"` entry, which is the
/// tensor that gets backpropagated.
pub type LossMap = BTreeMap<String, Tensor>;

/// Named scalar metrics.
pub type Metrics = BTreeMap<String, f64>;

/// Key of the loss term that is optimized.
pub const TOTAL_LOSS: &str = "total";

/// Output of [`NcaModel::validate`].
#[derive(Debug, Clone)]
pub struct Validation {
    /// Metrics computed on the prediction.
    pub metrics: Metrics,
    /// Final NCA state.
    pub prediction: Tensor,
}

/// Contract between a trainable NCA model and the training loop.
///
/// Inputs passed to [`forward`](NcaModel::forward),
/// [`validate`](NcaModel::validate) and [`metrics`](NcaModel::metrics) are
/// full NCA states of shape (B, [`num_channels`](NcaModel::num_channels), H, W);
/// the trainer pads and prepares raw batches before handing them over.
pub trait NcaModel: Sized {
    /// Run `steps` update iterations on `state`.
    fn forward(&self, state: &Tensor, steps: usize) -> Result<Tensor>;

    /// Loss terms of `prediction` against `target`, including `"total"`.
    fn loss(&self, prediction: &Tensor, target: &Tensor) -> Result<LossMap>;

    /// Metrics of an already computed prediction.
    fn score(&self, prediction: &Tensor, target: &Tensor) -> Result<Metrics>;

    /// Run `steps` iterations on `x` and score the result against `y`.
    fn validate(&self, x: &Tensor, y: &Tensor, steps: usize) -> Result<Validation>;

    /// Run the model's own inference schedule on `x` and score against `y`.
    fn metrics(&self, x: &Tensor, y: &Tensor) -> Result<Metrics>;

    /// Render input, prediction and target of a batch for a summary writer.
    ///
    /// The trainer calls this when no plot function is passed to
    /// [`Trainer::train`](crate::trainer::Trainer::train).
    fn plot(&self, x: &Tensor, prediction: &Tensor, y: &Tensor) -> Result<Figure>;

    /// Model-specific transformation of a padded input batch.
    fn prepare_input(&self, x: &Tensor) -> Result<Tensor>;

    /// Total number of state channels.
    fn num_channels(&self) -> usize;

    /// Number of leading channels holding the input image.
    fn num_image_channels(&self) -> usize;

    /// Leading channels kept fixed by the update rule. Pool damage leaves
    /// them intact.
    fn num_immutable_channels(&self) -> usize;

    /// Name of the metric used for best-model selection (higher is better).
    fn validation_metric(&self) -> &str;

    /// Whether padded channels start as noise instead of zeros.
    fn pad_noise(&self) -> bool;

    /// Device holding parameters and states.
    fn device(&self) -> &Device;

    /// Trainable parameters.
    fn varmap(&self) -> &VarMap;

    /// Switch between training and evaluation mode.
    fn set_training(&mut self, training: bool);

    /// Whether the model is in training mode.
    fn is_training(&self) -> bool;

    /// Independent copy with its own parameter storage.
    fn try_clone(&self) -> Result<Self>;
}

/// Reduce a rank-0 or single-element tensor to `f64`.
pub(crate) fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t
        .flatten_all()?
        .mean_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_scalar::<f64>()?)
}

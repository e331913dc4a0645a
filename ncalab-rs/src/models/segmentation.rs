//! NCA for per-pixel binary segmentation.
//!
//! The image channels stay fixed, the hidden channels carry state, and the
//! trailing output channels hold one logit per class.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use super::rule::{NcaSettings, UpdateRule};
use super::{scalar, LossMap, Metrics, NcaModel, Validation, TOTAL_LOSS};
use crate::error::{NcaError, Result};
use crate::summary_writer::{plot_batch_grid, Figure};

/// Smoothing term of the soft dice loss.
const DICE_SMOOTH: f64 = 1.0;

/// Segmentation NCA trained with BCE-with-logits plus soft dice.
pub struct SegmentationNca {
    rule: UpdateRule,
}

impl SegmentationNca {
    /// Build a segmentation NCA.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or declare no output
    /// channels.
    pub fn new(settings: NcaSettings, device: &Device) -> Result<Self> {
        if settings.num_output_channels == 0 {
            return Err(NcaError::config(
                "segmentation NCA needs at least one output channel",
            ));
        }
        Ok(Self {
            rule: UpdateRule::new(settings, device)?,
        })
    }

    /// Settings of the underlying update rule.
    pub fn settings(&self) -> &NcaSettings {
        self.rule.settings()
    }

    /// Output logits of a state together with the target as (B, K, H, W).
    fn logits_and_target(&self, prediction: &Tensor, target: &Tensor) -> Result<(Tensor, Tensor)> {
        let s = self.rule.settings();
        let first = s.num_image_channels + s.num_hidden_channels;
        let logits = prediction.narrow(1, first, s.num_output_channels)?;
        let target = match target.rank() {
            3 => target.unsqueeze(1)?,
            _ => target.clone(),
        }
        .to_dtype(DType::F32)?;
        if logits.dims() != target.dims() {
            return Err(NcaError::shape_mismatch(
                format!("{:?}", logits.dims()),
                format!("{:?}", target.dims()),
            ));
        }
        Ok((logits, target))
    }
}

/// Numerically stable mean BCE on logits:
/// `max(x, 0) - x * y + log(1 + exp(-|x|))`.
fn bce_with_logits(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((logits.relu()? - (logits * target)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

fn soft_dice_loss(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let probs = candle_nn::ops::sigmoid(logits)?;
    let intersection = (&probs * target)?.sum_all()?;
    let denominator = ((probs.sum_all()? + target.sum_all()?)? + DICE_SMOOTH)?;
    let dice = ((intersection * 2.0)? + DICE_SMOOTH)?.div(&denominator)?;
    Ok(dice.neg()?.affine(1.0, 1.0)?)
}

impl NcaModel for SegmentationNca {
    fn forward(&self, state: &Tensor, steps: usize) -> Result<Tensor> {
        self.rule.forward(state, steps)
    }

    fn loss(&self, prediction: &Tensor, target: &Tensor) -> Result<LossMap> {
        let (logits, target) = self.logits_and_target(prediction, target)?;
        let bce = bce_with_logits(&logits, &target)?;
        let dice = soft_dice_loss(&logits, &target)?;
        let total = (&bce + &dice)?;
        Ok(LossMap::from([
            ("bce".to_string(), bce),
            ("dice".to_string(), dice),
            (TOTAL_LOSS.to_string(), total),
        ]))
    }

    fn score(&self, prediction: &Tensor, target: &Tensor) -> Result<Metrics> {
        let (logits, target) = self.logits_and_target(prediction, target)?;
        let predicted = logits.gt(0f32)?.to_dtype(DType::F32)?;
        let target = target.gt(0.5f32)?.to_dtype(DType::F32)?;

        let intersection = scalar(&(&predicted * &target)?.sum_all()?)?;
        let predicted_sum = scalar(&predicted.sum_all()?)?;
        let target_sum = scalar(&target.sum_all()?)?;
        let union = predicted_sum + target_sum - intersection;

        // Two empty masks agree perfectly.
        let (dice, iou) = if union == 0.0 {
            (1.0, 1.0)
        } else {
            (
                2.0 * intersection / (predicted_sum + target_sum),
                intersection / union,
            )
        };
        Ok(Metrics::from([
            ("dice".to_string(), dice),
            ("iou".to_string(), iou),
        ]))
    }

    fn validate(&self, x: &Tensor, y: &Tensor, steps: usize) -> Result<Validation> {
        let prediction = self.forward(x, steps)?;
        let metrics = self.score(&prediction, y)?;
        Ok(Validation {
            metrics,
            prediction,
        })
    }

    fn metrics(&self, x: &Tensor, y: &Tensor) -> Result<Metrics> {
        let steps = self.rule.settings().inference_steps;
        Ok(self.validate(x, y, steps)?.metrics)
    }

    fn prepare_input(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn num_channels(&self) -> usize {
        self.rule.settings().num_channels()
    }

    /// Image channels next to the predicted probabilities and the mask.
    fn plot(&self, x: &Tensor, prediction: &Tensor, y: &Tensor) -> Result<Figure> {
        let (logits, target) = self.logits_and_target(prediction, y)?;
        let probs = candle_nn::ops::sigmoid(&logits)?;
        plot_batch_grid(x, &probs, &target, self.num_image_channels())
    }

    fn num_image_channels(&self) -> usize {
        self.rule.settings().num_image_channels
    }

    fn num_immutable_channels(&self) -> usize {
        self.rule.settings().num_immutable_channels()
    }

    fn validation_metric(&self) -> &str {
        "dice"
    }

    fn pad_noise(&self) -> bool {
        self.rule.settings().pad_noise
    }

    fn device(&self) -> &Device {
        self.rule.device()
    }

    fn varmap(&self) -> &VarMap {
        self.rule.varmap()
    }

    fn set_training(&mut self, training: bool) {
        self.rule.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.rule.is_training()
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            rule: self.rule.try_clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> SegmentationNca {
        let settings = NcaSettings {
            hidden_size: 8,
            ..NcaSettings::segmentation(3, 4, 1)
        };
        SegmentationNca::new(settings, &Device::Cpu).unwrap()
    }

    /// State whose single output channel is `logit` everywhere.
    fn state_with_logit(logit: f32) -> Tensor {
        let base = Tensor::zeros((1, 7, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let logits = Tensor::full(logit, (1, 1, 4, 4), &Device::Cpu).unwrap();
        Tensor::cat(&[&base, &logits], 1).unwrap()
    }

    #[test]
    fn test_perfect_prediction_scores_one() {
        let model = model();
        let target = Tensor::ones((1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let metrics = model.score(&state_with_logit(5.0), &target).unwrap();
        assert!((metrics["dice"] - 1.0).abs() < 1e-9);
        assert!((metrics["iou"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_disjoint_prediction_scores_zero() {
        let model = model();
        let target = Tensor::zeros((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let metrics = model.score(&state_with_logit(5.0), &target).unwrap();
        assert_eq!(metrics["dice"], 0.0);
        assert_eq!(metrics["iou"], 0.0);
    }

    #[test]
    fn test_loss_terms() {
        let model = model();
        let target = Tensor::ones((1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let good = model.loss(&state_with_logit(5.0), &target).unwrap();
        let bad = model.loss(&state_with_logit(-5.0), &target).unwrap();
        let good_total = good[TOTAL_LOSS].to_scalar::<f32>().unwrap();
        let bad_total = bad[TOTAL_LOSS].to_scalar::<f32>().unwrap();
        assert!(good_total < bad_total);
        assert!(good.contains_key("bce") && good.contains_key("dice"));

        // At logit 0 the BCE term is ln 2.
        let neutral = model.loss(&state_with_logit(0.0), &target).unwrap();
        let bce = neutral["bce"].to_scalar::<f32>().unwrap();
        assert!((bce - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_plot_shows_probabilities_and_mask() {
        let model = model();
        let x = Tensor::zeros((1, 8, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::ones((1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let figure = model.plot(&x, &state_with_logit(5.0), &target).unwrap();

        // Three 4x4 panels separated by two-pixel gaps.
        assert_eq!((figure.height(), figure.width()), (4, 16));
        assert_eq!(figure.pixel(0, 0), [0, 0, 0]);
        // sigmoid(5) in grayscale.
        assert_eq!(figure.pixel(0, 6), [253, 253, 253]);
        assert_eq!(figure.pixel(0, 12), [255, 255, 255]);
    }

    #[test]
    fn test_image_channels_are_fixed() {
        let mut model = model();
        model.set_training(false);
        {
            let data = model.varmap().data().lock().unwrap();
            let w = data.get("fc1.weight").unwrap();
            w.set(&w.ones_like().unwrap()).unwrap();
        }
        let x = Tensor::rand(0f32, 1f32, (1, 8, 4, 4), &Device::Cpu).unwrap();
        let out = model.forward(&x, 2).unwrap();
        let diff = (out.narrow(1, 0, 3).unwrap() - x.narrow(1, 0, 3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_requires_output_channel() {
        let settings = NcaSettings::segmentation(3, 4, 0);
        assert!(SegmentationNca::new(settings, &Device::Cpu).is_err());
    }
}

//! NCA that grows an image from a seed state.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use super::rule::{NcaSettings, UpdateRule};
use super::{scalar, LossMap, Metrics, NcaModel, Validation, TOTAL_LOSS};
use crate::error::{NcaError, Result};
use crate::summary_writer::{plot_batch_grid, Figure};

/// Upper bound reported for PSNR when the prediction is exact.
const MAX_PSNR: f64 = 100.0;

/// Growing NCA: the image channels of the final state are regressed onto an
/// RGBA target with mean squared error.
pub struct GrowingNca {
    rule: UpdateRule,
}

impl GrowingNca {
    /// Build a growing NCA.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or declare output
    /// channels.
    pub fn new(settings: NcaSettings, device: &Device) -> Result<Self> {
        if settings.num_output_channels != 0 {
            return Err(NcaError::config("growing NCA has no output channels"));
        }
        Ok(Self {
            rule: UpdateRule::new(settings, device)?,
        })
    }

    /// Settings of the underlying update rule.
    pub fn settings(&self) -> &NcaSettings {
        self.rule.settings()
    }

    fn image_channels(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        let img = self.rule.settings().num_image_channels;
        let image = prediction.narrow(1, 0, img)?;
        if image.dims() != target.dims() {
            return Err(NcaError::shape_mismatch(
                format!("{:?}", image.dims()),
                format!("{:?}", target.dims()),
            ));
        }
        Ok(image)
    }
}

impl NcaModel for GrowingNca {
    fn forward(&self, state: &Tensor, steps: usize) -> Result<Tensor> {
        self.rule.forward(state, steps)
    }

    fn loss(&self, prediction: &Tensor, target: &Tensor) -> Result<LossMap> {
        let image = self.image_channels(prediction, target)?;
        let mse = (image - target)?.sqr()?.mean_all()?;
        let mut losses = LossMap::new();
        losses.insert("mse".to_string(), mse.clone());
        losses.insert(TOTAL_LOSS.to_string(), mse);
        Ok(losses)
    }

    fn score(&self, prediction: &Tensor, target: &Tensor) -> Result<Metrics> {
        let image = self.image_channels(prediction, target)?;
        let mse = scalar(&(image - target)?.sqr()?.mean_all()?)?;
        let psnr = if mse > 0.0 {
            (-10.0 * mse.log10()).min(MAX_PSNR)
        } else {
            MAX_PSNR
        };
        Ok(Metrics::from([
            ("mse".to_string(), mse),
            ("psnr".to_string(), psnr),
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

    fn plot(&self, x: &Tensor, prediction: &Tensor, y: &Tensor) -> Result<Figure> {
        plot_batch_grid(x, prediction, y, self.num_image_channels())
    }

    fn num_image_channels(&self) -> usize {
        self.rule.settings().num_image_channels
    }

    fn num_immutable_channels(&self) -> usize {
        self.rule.settings().num_immutable_channels()
    }

    fn validation_metric(&self) -> &str {
        "psnr"
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
    use candle_core::DType;

    fn model() -> GrowingNca {
        let settings = NcaSettings {
            hidden_size: 8,
            ..NcaSettings::growing(4, 4)
        };
        GrowingNca::new(settings, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_loss_is_mse_on_image_channels() {
        let model = model();
        let prediction = Tensor::ones((2, 8, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::zeros((2, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let losses = model.loss(&prediction, &target).unwrap();
        let total = losses[TOTAL_LOSS].to_scalar::<f32>().unwrap();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(losses.contains_key("mse"));
    }

    #[test]
    fn test_psnr_is_capped() {
        let model = model();
        let prediction = Tensor::zeros((1, 8, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::zeros((1, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let metrics = model.score(&prediction, &target).unwrap();
        assert_eq!(metrics["psnr"], MAX_PSNR);
        assert_eq!(metrics["mse"], 0.0);
    }

    #[test]
    fn test_target_shape_is_checked() {
        let model = model();
        let prediction = Tensor::zeros((1, 8, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(model.loss(&prediction, &target).is_err());
    }

    #[test]
    fn test_rejects_output_channels() {
        let settings = NcaSettings {
            num_output_channels: 1,
            ..NcaSettings::growing(4, 4)
        };
        assert!(GrowingNca::new(settings, &Device::Cpu).is_err());
    }

    #[test]
    fn test_validate_reports_validation_metric() {
        let model = model();
        let x = Tensor::zeros((1, 8, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros((1, 4, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let validation = model.validate(&x, &y, 3).unwrap();
        assert!(validation.metrics.contains_key(model.validation_metric()));
        assert_eq!(validation.prediction.dims(), x.dims());
    }
}

//! Coarse-to-fine inference over several resolutions.
//!
//! A [`CascadeNca`] runs its base model first on a heavily downsampled copy
//! of the state, then upsamples the result and continues at the next finer
//! scale, until the last level runs at full resolution. Coarse levels move
//! information across the image in few steps; the fine levels add detail.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::error::{NcaError, Result};
use crate::models::{LossMap, Metrics, NcaModel, Validation};
use crate::summary_writer::Figure;

/// Multi-scale wrapper around an NCA model.
pub struct CascadeNca<M: NcaModel> {
    base: M,
    scales: Vec<usize>,
    steps: Vec<usize>,
}

impl<M: NcaModel> CascadeNca<M> {
    /// Wrap `base` with one level per `(scales[i], steps[i])` pair.
    ///
    /// `scales` are downsampling factors ordered coarse to fine; they must
    /// strictly decrease and end with 1.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] on empty or mismatched lists, factors
    /// that are zero, not strictly decreasing or not ending in 1, and zero
    /// step counts.
    pub fn new(base: M, scales: Vec<usize>, steps: Vec<usize>) -> Result<Self> {
        if scales.is_empty() {
            return Err(NcaError::config("cascade needs at least one level"));
        }
        if scales.len() != steps.len() {
            return Err(NcaError::Config(format!(
                "cascade has {} scales but {} step counts",
                scales.len(),
                steps.len()
            )));
        }
        if scales.contains(&0) {
            return Err(NcaError::config("cascade scale factors must be >= 1"));
        }
        if scales.windows(2).any(|pair| pair[0] <= pair[1]) {
            return Err(NcaError::Config(format!(
                "cascade scales must be strictly decreasing, got {scales:?}"
            )));
        }
        if scales.last() != Some(&1) {
            return Err(NcaError::Config(format!(
                "last cascade scale must be 1, got {scales:?}"
            )));
        }
        if steps.contains(&0) {
            return Err(NcaError::config("cascade step counts must be >= 1"));
        }
        tracing::debug!("Cascade levels: scales {:?}, steps {:?}", scales, steps);
        Ok(Self { base, scales, steps })
    }

    /// Downsampling factors, coarse to fine.
    pub fn scales(&self) -> &[usize] {
        &self.scales
    }

    /// Steps per level.
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    /// Total update steps of one forward pass.
    pub fn total_steps(&self) -> usize {
        self.steps.iter().sum()
    }

    /// The wrapped model.
    pub fn base(&self) -> &M {
        &self.base
    }

    /// Unwrap into the base model.
    pub fn into_base(self) -> M {
        self.base
    }

    fn check_divisible(&self, h: usize, w: usize) -> Result<()> {
        for &factor in &self.scales {
            if h % factor != 0 || w % factor != 0 {
                return Err(NcaError::shape_mismatch(
                    format!("height and width divisible by {factor}"),
                    format!("{h}x{w}"),
                ));
            }
        }
        Ok(())
    }
}

fn downscale(x: &Tensor, factor: usize) -> Result<Tensor> {
    if factor == 1 {
        return Ok(x.clone());
    }
    Ok(x.avg_pool2d(factor)?)
}

impl<M: NcaModel> NcaModel for CascadeNca<M> {
    /// Runs every level with its own step count; `steps` is ignored.
    fn forward(&self, state: &Tensor, _steps: usize) -> Result<Tensor> {
        let (_, c, h, w) = state.dims4()?;
        self.check_divisible(h, w)?;
        let img = self.base.num_image_channels();
        let image = state.narrow(1, 0, img)?;

        let mut x = downscale(state, self.scales[0])?;
        for (level, &steps) in self.steps.iter().enumerate() {
            x = self.base.forward(&x, steps)?;
            let Some(&next) = self.scales.get(level + 1) else {
                break;
            };
            x = x.upsample_nearest2d(h / next, w / next)?;
            if c > img {
                let image = downscale(&image, next)?;
                x = Tensor::cat(&[&image, &x.narrow(1, img, c - img)?], 1)?;
            }
        }
        Ok(x)
    }

    fn loss(&self, prediction: &Tensor, target: &Tensor) -> Result<LossMap> {
        self.base.loss(prediction, target)
    }

    fn score(&self, prediction: &Tensor, target: &Tensor) -> Result<Metrics> {
        self.base.score(prediction, target)
    }

    fn validate(&self, x: &Tensor, y: &Tensor, steps: usize) -> Result<Validation> {
        let prediction = self.forward(x, steps)?;
        let metrics = self.base.score(&prediction, y)?;
        Ok(Validation {
            metrics,
            prediction,
        })
    }

    fn metrics(&self, x: &Tensor, y: &Tensor) -> Result<Metrics> {
        let prediction = self.forward(x, self.total_steps())?;
        self.base.score(&prediction, y)
    }

    fn prepare_input(&self, x: &Tensor) -> Result<Tensor> {
        self.base.prepare_input(x)
    }

    fn num_channels(&self) -> usize {
        self.base.num_channels()
    }

    fn plot(&self, x: &Tensor, prediction: &Tensor, y: &Tensor) -> Result<Figure> {
        self.base.plot(x, prediction, y)
    }

    fn num_image_channels(&self) -> usize {
        self.base.num_image_channels()
    }

    fn num_immutable_channels(&self) -> usize {
        self.base.num_immutable_channels()
    }

    fn validation_metric(&self) -> &str {
        self.base.validation_metric()
    }

    fn pad_noise(&self) -> bool {
        self.base.pad_noise()
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn varmap(&self) -> &VarMap {
        self.base.varmap()
    }

    fn set_training(&mut self, training: bool) {
        self.base.set_training(training);
    }

    fn is_training(&self) -> bool {
        self.base.is_training()
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            base: self.base.try_clone()?,
            scales: self.scales.clone(),
            steps: self.steps.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NcaSettings, SegmentationNca};
    use candle_core::DType;

    fn base() -> SegmentationNca {
        let settings = NcaSettings {
            hidden_size: 8,
            ..NcaSettings::segmentation(3, 4, 1)
        };
        SegmentationNca::new(settings, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_rejects_invalid_levels() {
        assert!(CascadeNca::new(base(), vec![], vec![]).is_err());
        assert!(CascadeNca::new(base(), vec![4, 1], vec![10]).is_err());
        assert!(CascadeNca::new(base(), vec![4, 2], vec![10, 10]).is_err());
        assert!(CascadeNca::new(base(), vec![2, 4, 1], vec![1, 1, 1]).is_err());
        assert!(CascadeNca::new(base(), vec![4, 4, 1], vec![1, 1, 1]).is_err());
        assert!(CascadeNca::new(base(), vec![4, 1], vec![10, 0]).is_err());
        assert!(CascadeNca::new(base(), vec![0, 1], vec![1, 1]).is_err());
    }

    #[test]
    fn test_output_keeps_input_shape() {
        let cascade = CascadeNca::new(base(), vec![4, 2, 1], vec![3, 2, 1]).unwrap();
        assert_eq!(cascade.total_steps(), 6);
        let x = Tensor::rand(0f32, 1f32, (2, 8, 16, 16), &Device::Cpu).unwrap();
        let out = cascade.forward(&x, 999).unwrap();
        assert_eq!(out.dims(), x.dims());
    }

    #[test]
    fn test_image_channels_match_input_at_full_resolution() {
        let cascade = CascadeNca::new(base(), vec![2, 1], vec![2, 2]).unwrap();
        let x = Tensor::rand(0f32, 1f32, (1, 8, 8, 8), &Device::Cpu).unwrap();
        let out = cascade.forward(&x, 0).unwrap();
        let diff = (out.narrow(1, 0, 3).unwrap() - x.narrow(1, 0, 3).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_rejects_indivisible_size() {
        let cascade = CascadeNca::new(base(), vec![4, 1], vec![1, 1]).unwrap();
        let x = Tensor::zeros((1, 8, 10, 10), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            cascade.forward(&x, 1),
            Err(NcaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_delegates_to_base() {
        let mut cascade = CascadeNca::new(base(), vec![2, 1], vec![1, 1]).unwrap();
        assert_eq!(cascade.num_channels(), 8);
        assert_eq!(cascade.num_image_channels(), 3);
        assert_eq!(cascade.validation_metric(), "dice");
        assert!(cascade.pad_noise());
        cascade.set_training(false);
        assert!(!cascade.base().is_training());

        let copy = cascade.try_clone().unwrap();
        assert_eq!(copy.scales(), &[2, 1]);
        assert_eq!(copy.steps(), &[1, 1]);
    }
}

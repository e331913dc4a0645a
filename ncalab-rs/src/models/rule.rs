//! The shared NCA update rule.
//!
//! Each step perceives the 3x3 neighbourhood of every cell with fixed
//! identity and Sobel filters, maps the perception through two 1x1
//! convolutions to a residual update, and applies that update to a random
//! subset of cells (the fire rate). The last convolution starts at zero, so a
//! freshly built rule leaves the state unchanged.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::{NcaError, Result};
use crate::utils::copy_varmap;

/// Alpha channel used for the alive mask.
const ALPHA_CHANNEL: usize = 3;
/// Cells whose 3x3 neighbourhood alpha stays at or below this are dead.
const ALIVE_THRESHOLD: f32 = 0.1;

/// Shape and behaviour of an NCA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NcaSettings {
    /// Channels holding the input image.
    pub num_image_channels: usize,
    /// Hidden state channels.
    pub num_hidden_channels: usize,
    /// Output channels (segmentation logits etc.), stored last.
    #[serde(default)]
    pub num_output_channels: usize,
    /// Probability that a cell applies its update in a step.
    #[serde(default = "default_fire_rate")]
    pub fire_rate: f64,
    /// Width of the hidden 1x1 convolution.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Zero out cells without a living neighbour (alpha channel).
    #[serde(default)]
    pub use_alive_mask: bool,
    /// Keep the image channels fixed; only hidden and output channels evolve.
    #[serde(default)]
    pub immutable_image_channels: bool,
    /// Initialize padded channels with noise instead of zeros.
    #[serde(default)]
    pub pad_noise: bool,
    /// Number of steps used by `metrics`.
    #[serde(default = "default_inference_steps")]
    pub inference_steps: usize,
}

fn default_fire_rate() -> f64 {
    0.5
}
fn default_hidden_size() -> usize {
    128
}
fn default_inference_steps() -> usize {
    100
}

impl NcaSettings {
    /// Settings for growing an RGBA image from a single seed cell.
    #[must_use]
    pub fn growing(num_image_channels: usize, num_hidden_channels: usize) -> Self {
        Self {
            num_image_channels,
            num_hidden_channels,
            num_output_channels: 0,
            fire_rate: default_fire_rate(),
            hidden_size: default_hidden_size(),
            use_alive_mask: true,
            immutable_image_channels: false,
            pad_noise: false,
            inference_steps: default_inference_steps(),
        }
    }

    /// Settings for per-pixel segmentation of an input image.
    #[must_use]
    pub fn segmentation(
        num_image_channels: usize,
        num_hidden_channels: usize,
        num_classes: usize,
    ) -> Self {
        Self {
            num_image_channels,
            num_hidden_channels,
            num_output_channels: num_classes,
            fire_rate: default_fire_rate(),
            hidden_size: default_hidden_size(),
            use_alive_mask: false,
            immutable_image_channels: true,
            pad_noise: true,
            inference_steps: default_inference_steps(),
        }
    }

    /// Total channel count.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.num_image_channels + self.num_hidden_channels + self.num_output_channels
    }

    /// Leading channels the update rule never writes.
    #[must_use]
    pub fn num_immutable_channels(&self) -> usize {
        if self.immutable_image_channels {
            self.num_image_channels
        } else {
            0
        }
    }

    /// Channels written by the update rule.
    #[must_use]
    pub fn num_updated_channels(&self) -> usize {
        self.num_channels() - self.num_immutable_channels()
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] on inconsistent values.
    pub fn validate(&self) -> Result<()> {
        if self.num_image_channels == 0 {
            return Err(NcaError::config("num_image_channels must be > 0"));
        }
        if self.num_updated_channels() == 0 {
            return Err(NcaError::config(
                "model has no channels the update rule may change",
            ));
        }
        if !(self.fire_rate > 0.0 && self.fire_rate <= 1.0) {
            return Err(NcaError::Config(format!(
                "fire_rate must be in (0, 1], got {}",
                self.fire_rate
            )));
        }
        if self.hidden_size == 0 {
            return Err(NcaError::config("hidden_size must be > 0"));
        }
        if self.use_alive_mask && self.num_image_channels <= ALPHA_CHANNEL {
            return Err(NcaError::config(
                "alive mask needs an alpha channel (num_image_channels >= 4)",
            ));
        }
        if self.inference_steps == 0 {
            return Err(NcaError::config("inference_steps must be > 0"));
        }
        Ok(())
    }
}

/// Learned local update rule with its parameters.
pub struct UpdateRule {
    settings: NcaSettings,
    device: Device,
    varmap: VarMap,
    perception: Tensor,
    fc0: Conv2d,
    fc1: Conv2d,
    training: bool,
}

impl UpdateRule {
    /// Build a rule with freshly initialized parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are invalid or allocation fails.
    pub fn new(settings: NcaSettings, device: &Device) -> Result<Self> {
        settings.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let channels = settings.num_channels();

        let fc0 = candle_nn::conv2d(
            3 * channels,
            settings.hidden_size,
            1,
            Conv2dConfig::default(),
            vb.pp("fc0"),
        )?;
        let fc1_weight = vb.pp("fc1").get_with_hints(
            (settings.num_updated_channels(), settings.hidden_size, 1, 1),
            "weight",
            Init::Const(0.0),
        )?;
        let fc1 = Conv2d::new(fc1_weight, None, Conv2dConfig::default());

        Ok(Self {
            perception: perception_kernel(channels, device)?,
            settings,
            device: device.clone(),
            varmap,
            fc0,
            fc1,
            training: true,
        })
    }

    /// Settings the rule was built with.
    pub fn settings(&self) -> &NcaSettings {
        &self.settings
    }

    /// Device of the parameters.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable parameters.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Switch between training and evaluation mode.
    ///
    /// In evaluation mode every step detaches the state, so long unrolls do
    /// not build a computation graph.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Whether the rule is in training mode.
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Same settings, independent copy of the current parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if building or copying fails.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::new(self.settings.clone(), &self.device)?;
        copy_varmap(&self.varmap, &copy.varmap)?;
        copy.training = self.training;
        Ok(copy)
    }

    /// Apply `steps` updates to `state`.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::ShapeMismatch`] if `state` does not have
    /// `num_channels` channels.
    pub fn forward(&self, state: &Tensor, steps: usize) -> Result<Tensor> {
        let (_, c, _, _) = state.dims4()?;
        if c != self.settings.num_channels() {
            return Err(NcaError::shape_mismatch(
                format!("{} channels", self.settings.num_channels()),
                format!("{c} channels"),
            ));
        }
        let mut state = state.clone();
        for _ in 0..steps {
            state = self.step(&state)?;
            if !self.training {
                state = state.detach();
            }
        }
        Ok(state)
    }

    fn step(&self, state: &Tensor) -> Result<Tensor> {
        let s = &self.settings;
        let (b, c, h, w) = state.dims4()?;
        let pre_alive = if s.use_alive_mask {
            Some(alive_mask(state)?)
        } else {
            None
        };

        let perceived = state.conv2d(&self.perception, 1, 1, 1, c)?;
        let mut dx = self.fc1.forward(&self.fc0.forward(&perceived)?.relu()?)?;
        if s.fire_rate < 1.0 {
            let fire = Tensor::rand(0f32, 1f32, (b, 1, h, w), &self.device)?
                .lt(s.fire_rate as f32)?
                .to_dtype(DType::F32)?;
            dx = dx.broadcast_mul(&fire)?;
        }

        let mut next = if s.immutable_image_channels {
            let img = s.num_image_channels;
            let image = state.narrow(1, 0, img)?;
            let rest = (state.narrow(1, img, c - img)? + dx)?;
            Tensor::cat(&[&image, &rest], 1)?
        } else {
            (state + dx)?
        };

        if let Some(pre_alive) = pre_alive {
            let alive = (pre_alive * alive_mask(&next)?)?;
            next = next.broadcast_mul(&alive)?;
        }
        Ok(next)
    }
}

/// Depthwise identity, Sobel-x and Sobel-y filters, shape (3C, 1, 3, 3).
fn perception_kernel(channels: usize, device: &Device) -> Result<Tensor> {
    const IDENTITY: [f32; 9] = [0., 0., 0., 0., 1., 0., 0., 0., 0.];
    const SOBEL_X: [f32; 9] = [-1., 0., 1., -2., 0., 2., -1., 0., 1.];
    const SOBEL_Y: [f32; 9] = [-1., -2., -1., 0., 0., 0., 1., 2., 1.];

    let mut data = Vec::with_capacity(channels * 27);
    for _ in 0..channels {
        data.extend_from_slice(&IDENTITY);
        data.extend(SOBEL_X.iter().map(|v| v / 8.0));
        data.extend(SOBEL_Y.iter().map(|v| v / 8.0));
    }
    Ok(Tensor::from_vec(data, (3 * channels, 1, 3, 3), device)?)
}

/// 1.0 where any cell in the 3x3 neighbourhood has alpha above the threshold.
fn alive_mask(state: &Tensor) -> Result<Tensor> {
    let alpha = state
        .narrow(1, ALPHA_CHANNEL, 1)?
        .pad_with_zeros(2, 1, 1)?
        .pad_with_zeros(3, 1, 1)?;
    let pooled = alpha.max_pool2d_with_stride((3, 3), (1, 1))?;
    Ok(pooled.gt(ALIVE_THRESHOLD)?.to_dtype(DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NcaSettings {
        NcaSettings {
            hidden_size: 16,
            ..NcaSettings::growing(4, 4)
        }
    }

    #[test]
    fn test_settings_validation() {
        assert!(settings().validate().is_ok());

        let no_alpha = NcaSettings {
            num_image_channels: 3,
            ..settings()
        };
        assert!(no_alpha.validate().is_err());

        let bad_fire = NcaSettings {
            fire_rate: 0.0,
            ..settings()
        };
        assert!(bad_fire.validate().is_err());
    }

    #[test]
    fn test_fresh_rule_keeps_state() {
        let rule = UpdateRule::new(settings(), &Device::Cpu).unwrap();
        let state = Tensor::ones((2, 8, 6, 6), DType::F32, &Device::Cpu).unwrap();
        let out = rule.forward(&state, 5).unwrap();
        assert_eq!(out.dims(), state.dims());
        let diff = (out - &state).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_dead_cells_are_zeroed() {
        let rule = UpdateRule::new(settings(), &Device::Cpu).unwrap();
        let state = Tensor::ones((1, 8, 6, 6), DType::F32, &Device::Cpu)
            .unwrap()
            .broadcast_mul(&Tensor::new(&[0f32], &Device::Cpu).unwrap())
            .unwrap();
        let out = rule.forward(&state, 1).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let rule = UpdateRule::new(settings(), &Device::Cpu).unwrap();
        let state = Tensor::ones((1, 5, 6, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            rule.forward(&state, 1),
            Err(NcaError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_perception_kernel_shape() {
        let kernel = perception_kernel(5, &Device::Cpu).unwrap();
        assert_eq!(kernel.dims(), &[15, 1, 3, 3]);
    }

    #[test]
    fn test_try_clone_is_independent() {
        let rule = UpdateRule::new(settings(), &Device::Cpu).unwrap();
        let copy = rule.try_clone().unwrap();
        {
            let data = rule.varmap().data().lock().unwrap();
            let w = data.get("fc1.weight").unwrap();
            w.set(&w.ones_like().unwrap()).unwrap();
        }
        let data = copy.varmap().data().lock().unwrap();
        let w = data.get("fc1.weight").unwrap();
        assert_eq!(w.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }
}

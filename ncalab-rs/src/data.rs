//! Batch sources consumed by the trainer.

use candle_core::{DType, Device, Tensor};

use crate::error::{NcaError, Result};

/// A finite, restartable sequence of `(input, target)` batches.
pub trait DataLoader {
    /// Number of batches per pass.
    fn len(&self) -> usize;

    /// Whether a pass yields no batches.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new pass over the data.
    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Tensor, Tensor)>> + '_>;
}

/// Splits in-memory tensors into consecutive batches along dimension 0.
///
/// The last batch is smaller when the sample count is not a multiple of the
/// batch size.
#[derive(Debug, Clone)]
pub struct TensorDataLoader {
    inputs: Tensor,
    targets: Tensor,
    batch_size: usize,
}

impl TensorDataLoader {
    /// Create a loader over `inputs` and `targets`.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] if `batch_size` is zero or the two
    /// tensors hold a different number of samples.
    pub fn new(inputs: Tensor, targets: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(NcaError::config("batch_size must be > 0"));
        }
        let (n_inputs, n_targets) = (inputs.dim(0)?, targets.dim(0)?);
        if n_inputs != n_targets {
            return Err(NcaError::Config(format!(
                "{n_inputs} inputs but {n_targets} targets"
            )));
        }
        Ok(Self {
            inputs,
            targets,
            batch_size,
        })
    }

    /// Total number of samples.
    pub fn num_samples(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    /// Samples per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl DataLoader for TensorDataLoader {
    fn len(&self) -> usize {
        self.num_samples().div_ceil(self.batch_size)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Tensor, Tensor)>> + '_> {
        let n = self.num_samples();
        Box::new(
            (0..n)
                .step_by(self.batch_size)
                .map(move |start| -> Result<(Tensor, Tensor)> {
                    let len = self.batch_size.min(n - start);
                    Ok((
                        self.inputs.narrow(0, start, len)?,
                        self.targets.narrow(0, start, len)?,
                    ))
                }),
        )
    }
}

/// Seed states and targets for growing `target` from a single cell.
///
/// `target` is an image of shape (C, H, W). Each seed has `num_channels`
/// channels, all zero except the center cell, where every channel from the
/// alpha channel onwards is 1.
///
/// # Errors
///
/// Returns an error if `target` is not rank 3 or has fewer than four or more
/// than `num_channels` channels.
pub fn growing_dataset(
    target: &Tensor,
    num_channels: usize,
    num_samples: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let (c, h, w) = target.dims3()?;
    if c < 4 || c > num_channels {
        return Err(NcaError::shape_mismatch(
            format!("RGBA target with at most {num_channels} channels"),
            format!("{:?}", target.dims()),
        ));
    }
    let mut seed = vec![0f32; num_channels * h * w];
    let center = (h / 2) * w + w / 2;
    for channel in 3..num_channels {
        seed[channel * h * w + center] = 1.0;
    }
    let seed = Tensor::from_vec(seed, (1, num_channels, h, w), device)?;
    let target = target.to_dtype(DType::F32)?.to_device(device)?.unsqueeze(0)?;

    let seeds = seed.repeat((num_samples, 1, 1, 1))?;
    let targets = target.repeat((num_samples, 1, 1, 1))?;
    Ok((seeds, targets))
}

/// RGBA image of a filled disc centered on a `size` x `size` canvas.
///
/// Used as the default growth target of the command-line tool.
pub fn disc_target(size: usize, color: [f32; 3], device: &Device) -> Result<Tensor> {
    let radius = size as f32 * 0.35;
    let center = (size as f32 - 1.0) / 2.0;
    let mut data = vec![0f32; 4 * size * size];
    for y in 0..size {
        for x in 0..size {
            let (dy, dx) = (y as f32 - center, x as f32 - center);
            if dx * dx + dy * dy <= radius * radius {
                let idx = y * size + x;
                for (channel, value) in color.iter().chain(&[1.0]).enumerate() {
                    data[channel * size * size + idx] = *value;
                }
            }
        }
    }
    Ok(Tensor::from_vec(data, (4, size, size), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn test_batches_cover_all_samples() {
        let x = Tensor::zeros((10, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros((10, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let loader = TensorDataLoader::new(x, y, 4).unwrap();
        assert_eq!(loader.len(), 3);

        let sizes: Vec<usize> = loader
            .iter()
            .map(|batch| batch.unwrap().0.dim(0).unwrap())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        // A second pass starts over.
        assert_eq!(loader.iter().count(), 3);
    }

    #[test]
    fn test_loader_validation() {
        let x = Tensor::zeros((3, 1), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros((2, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(TensorDataLoader::new(x.clone(), y, 1).is_err());
        assert!(TensorDataLoader::new(x.clone(), x, 0).is_err());
    }

    #[test]
    fn test_growing_dataset_seed() {
        let target = disc_target(8, [1.0, 0.0, 0.0], &Device::Cpu).unwrap();
        let (x, y) = growing_dataset(&target, 6, 3, &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[3, 6, 8, 8]);
        assert_eq!(y.dims(), &[3, 4, 8, 8]);
        // Channels 3, 4 and 5 of the center cell are alive in each sample.
        let total = x.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(total, 9.0);
        let alpha = x.narrow(1, 3, 1).unwrap().i((0, 0, 4, 4)).unwrap();
        assert_eq!(alpha.to_scalar::<f32>().unwrap(), 1.0);
    }

    #[test]
    fn test_disc_target_alpha() {
        let target = disc_target(16, [0.2, 0.4, 0.6], &Device::Cpu).unwrap();
        let alpha: Vec<f32> = target.get(3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(alpha.iter().all(|v| *v == 0.0 || *v == 1.0));
        assert_eq!(alpha[0], 0.0);
        assert_eq!(alpha[8 * 16 + 8], 1.0);
    }
}

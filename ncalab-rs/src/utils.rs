//! Helpers shared by the trainer, the models and the CLI.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{NcaError, Result};

/// Create the random number generator used for step counts, pool sampling
/// and padding noise. Call once at program start and thread the returned
/// generator through.
pub fn fix_random_seed(seed: u64) -> ChaCha8Rng {
    tracing::debug!("Seeding random number generator with {}", seed);
    ChaCha8Rng::seed_from_u64(seed)
}

/// Resolve a device name such as `"cpu"`, `"cuda"` or `"cuda:1"`.
///
/// Falls back to the CPU with a warning when CUDA is requested but not
/// available.
///
/// # Errors
///
/// Returns [`NcaError::Config`] for unrecognized names.
pub fn get_compute_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match name.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .strip_prefix(':')
            .and_then(|idx| idx.parse::<usize>().ok())
            .ok_or_else(|| NcaError::Config(format!("invalid device name '{name}'")))?,
        None => return Err(NcaError::Config(format!("invalid device name '{name}'"))),
    };
    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Compute device: CUDA (device {})", ordinal);
            Ok(device)
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Ok(Device::Cpu)
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Pad a batch along the channel axis to `num_channels`.
///
/// Accepts (B, C, H, W) or single-channel (B, H, W) input. New channels are
/// filled with uniform noise in [0, 1) when `noise` is set, zeros otherwise.
///
/// # Errors
///
/// Returns [`NcaError::ShapeMismatch`] if the input has the wrong rank or
/// already more channels than requested.
pub fn pad_input<R: Rng + ?Sized>(
    x: &Tensor,
    num_channels: usize,
    noise: bool,
    rng: &mut R,
) -> Result<Tensor> {
    let x = match x.rank() {
        3 => x.unsqueeze(1)?,
        4 => x.clone(),
        _ => {
            return Err(NcaError::shape_mismatch(
                "(B, C, H, W) or (B, H, W)",
                format!("{:?}", x.dims()),
            ))
        }
    };
    let x = x.to_dtype(DType::F32)?;
    let (b, c, h, w) = x.dims4()?;
    if c > num_channels {
        return Err(NcaError::shape_mismatch(
            format!("at most {num_channels} channels"),
            format!("{c} channels"),
        ));
    }
    if c == num_channels {
        return Ok(x);
    }
    let extra = num_channels - c;
    let fill = if noise {
        let values: Vec<f32> = (0..b * extra * h * w).map(|_| rng.gen::<f32>()).collect();
        Tensor::from_vec(values, (b, extra, h, w), x.device())?
    } else {
        Tensor::zeros((b, extra, h, w), DType::F32, x.device())?
    };
    Ok(Tensor::cat(&[&x, &fill], 1)?)
}

/// Repeat a batch `times` times along the batch axis.
pub fn repeat_batch(x: &Tensor, times: usize) -> Result<Tensor> {
    if times <= 1 {
        return Ok(x.clone());
    }
    let copies = vec![x; times];
    Ok(Tensor::cat(&copies, 0)?)
}

/// Path of the best-model checkpoint derived from the regular one:
/// `model.safetensors` becomes `model.best.safetensors`.
pub fn best_checkpoint_path(path: &Path) -> PathBuf {
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => path.with_file_name(format!(
            "{}.best.{}",
            stem.to_string_lossy(),
            ext.to_string_lossy()
        )),
        _ => {
            let mut name = path.as_os_str().to_owned();
            name.push(".best");
            PathBuf::from(name)
        }
    }
}

/// Write all variables to a safetensors file.
///
/// The data goes to a temporary sibling first and is renamed into place, so
/// an interrupted write never leaves a truncated checkpoint behind.
///
/// # Errors
///
/// Returns an error if serialization or any filesystem operation fails.
pub fn save_checkpoint<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    varmap
        .save(&tmp)
        .map_err(|e| NcaError::Checkpoint(format!("failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)?;
    tracing::debug!("Saved checkpoint to {}", path.display());
    Ok(())
}

/// Load a safetensors checkpoint into the variables of `varmap`.
///
/// Every variable must be present in the file with a matching shape.
///
/// # Errors
///
/// Returns [`NcaError::Checkpoint`] on missing or mismatching tensors.
pub fn load_checkpoint<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    let data = varmap
        .data()
        .lock()
        .map_err(|_| NcaError::Checkpoint("parameter store lock poisoned".into()))?;
    let Some(device) = data.values().next().map(|v| v.device().clone()) else {
        return Ok(());
    };
    let tensors = candle_core::safetensors::load(path, &device)
        .map_err(|e| NcaError::Checkpoint(format!("failed to read {}: {e}", path.display())))?;
    for (name, var) in data.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            NcaError::Checkpoint(format!("{} has no tensor '{name}'", path.display()))
        })?;
        var.set(tensor).map_err(|e| {
            NcaError::Checkpoint(format!("cannot restore '{name}': {e}"))
        })?;
    }
    tracing::info!("Loaded {} tensors from {}", data.len(), path.display());
    Ok(())
}

/// Copy every variable of `src` into `dst`, matching by name.
pub(crate) fn copy_varmap(src: &VarMap, dst: &VarMap) -> Result<()> {
    let src = src
        .data()
        .lock()
        .map_err(|_| NcaError::Checkpoint("parameter store lock poisoned".into()))?;
    let dst = dst
        .data()
        .lock()
        .map_err(|_| NcaError::Checkpoint("parameter store lock poisoned".into()))?;
    for (name, var) in dst.iter() {
        let source = src
            .get(name)
            .ok_or_else(|| NcaError::Checkpoint(format!("missing parameter '{name}'")))?;
        var.set(&source.as_tensor().copy()?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_checkpoint_path() {
        assert_eq!(
            best_checkpoint_path(Path::new("weights/model.safetensors")),
            PathBuf::from("weights/model.best.safetensors")
        );
        assert_eq!(
            best_checkpoint_path(Path::new("weights/model")),
            PathBuf::from("weights/model.best")
        );
    }

    #[test]
    fn test_pad_input_zeros() {
        let mut rng = fix_random_seed(0);
        let x = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let padded = pad_input(&x, 8, false, &mut rng).unwrap();
        assert_eq!(padded.dims(), &[2, 8, 4, 4]);
        let hidden_sum = padded
            .narrow(1, 3, 5)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(hidden_sum, 0.0);
    }

    #[test]
    fn test_pad_input_noise_and_grayscale() {
        let mut rng = fix_random_seed(0);
        let x = Tensor::ones((2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let padded = pad_input(&x, 4, true, &mut rng).unwrap();
        assert_eq!(padded.dims(), &[2, 4, 4, 4]);
        let noise: Vec<f32> = padded.narrow(1, 1, 3).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(noise.iter().all(|v| (0.0..1.0).contains(v)));
        assert!(noise.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_pad_input_rejects_too_many_channels() {
        let mut rng = fix_random_seed(0);
        let x = Tensor::ones((1, 5, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(pad_input(&x, 4, false, &mut rng).is_err());
    }

    #[test]
    fn test_repeat_batch() {
        let x = Tensor::arange(0f32, 8., &Device::Cpu)
            .unwrap()
            .reshape((2, 1, 2, 2))
            .unwrap();
        let repeated = repeat_batch(&x, 3).unwrap();
        assert_eq!(repeated.dims(), &[6, 1, 2, 2]);
        for k in 0..3 {
            let chunk = repeated.narrow(0, 2 * k, 2).unwrap();
            let diff = (chunk - &x).unwrap().abs().unwrap().sum_all().unwrap();
            assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        }
    }

    #[test]
    fn test_device_names() {
        assert!(matches!(get_compute_device("cpu").unwrap(), Device::Cpu));
        assert!(get_compute_device("tpu").is_err());
        assert!(get_compute_device("cuda:x").is_err());
    }
}

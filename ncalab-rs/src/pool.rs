//! Replay pool of past NCA states.
//!
//! Feeding previous outputs back in as starting states teaches an NCA to
//! keep a pattern stable over long horizons; damaging some of them teaches
//! it to regrow missing regions.

use std::collections::VecDeque;

use candle_core::Tensor;
use rand::Rng;

use crate::error::{NcaError, Result};

/// Fixed-capacity FIFO buffer of detached state batches.
///
/// The pool is not synchronized; share it across threads only behind a
/// lock of your own.
#[derive(Debug, Clone)]
pub struct ReplayPool {
    capacity: usize,
    damage: bool,
    replace_probability: f64,
    damage_probability: f64,
    protected_channels: usize,
    entries: VecDeque<Tensor>,
}

impl ReplayPool {
    /// Create an empty pool holding up to `capacity` batches.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] if `capacity` is zero.
    pub fn new(capacity: usize, damage: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(NcaError::config("pool capacity must be > 0"));
        }
        Ok(Self {
            capacity,
            damage,
            replace_probability: 0.5,
            damage_probability: 0.5,
            protected_channels: 0,
            entries: VecDeque::with_capacity(capacity),
        })
    }

    /// Probability that a batch item is replaced by a pooled state.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] if `p` is outside [0, 1].
    pub fn with_replace_probability(mut self, p: f64) -> Result<Self> {
        self.replace_probability = check_probability("replace_probability", p)?;
        Ok(self)
    }

    /// Probability that a replaced item is damaged (damage mode only).
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] if `p` is outside [0, 1].
    pub fn with_damage_probability(mut self, p: f64) -> Result<Self> {
        self.damage_probability = check_probability("damage_probability", p)?;
        Ok(self)
    }

    /// Leave the first `n` channels untouched when damaging a state.
    ///
    /// [`Trainer::with_pool`](crate::trainer::Trainer::with_pool) raises this
    /// to the model's immutable channel count.
    #[must_use]
    pub fn with_protected_channels(mut self, n: usize) -> Self {
        self.protected_channels = n;
        self
    }

    /// Number of leading channels damage never touches.
    pub fn protected_channels(&self) -> usize {
        self.protected_channels
    }

    /// Maximum number of stored batches.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored batches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether sampled states get damaged.
    pub fn damage(&self) -> bool {
        self.damage
    }

    /// Drop all stored batches.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Mix pooled states into `batch`.
    ///
    /// Until the pool is full the batch is returned unchanged. Afterwards
    /// one stored batch is picked uniformly, and every item of `batch` is,
    /// with the replace probability, swapped for a random item of it. The
    /// caller's tensor is never modified.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::ShapeMismatch`] if the stored states do not share
    /// the batch's channel and spatial dimensions.
    pub fn sample<R: Rng + ?Sized>(&self, batch: &Tensor, rng: &mut R) -> Result<Tensor> {
        if self.entries.len() < self.capacity {
            return Ok(batch.clone());
        }
        let entry = &self.entries[rng.gen_range(0..self.entries.len())];
        let (b, c, h, w) = batch.dims4()?;
        let (pooled, ec, eh, ew) = entry.dims4()?;
        if (c, h, w) != (ec, eh, ew) {
            return Err(NcaError::shape_mismatch(
                format!("(_, {c}, {h}, {w})"),
                format!("{:?}", entry.dims()),
            ));
        }

        let mut items = Vec::with_capacity(b);
        for i in 0..b {
            if rng.gen_bool(self.replace_probability) {
                let mut item = entry.narrow(0, rng.gen_range(0..pooled), 1)?;
                if self.damage && rng.gen_bool(self.damage_probability) {
                    item = damage_item(&item, self.protected_channels, rng)?;
                }
                items.push(item);
            } else {
                items.push(batch.narrow(0, i, 1)?);
            }
        }
        Ok(Tensor::cat(&items, 0)?)
    }

    /// Store a detached copy of `batch`, evicting the oldest entry when full.
    pub fn update(&mut self, batch: &Tensor) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(batch.detach());
    }
}

fn check_probability(name: &str, p: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(NcaError::Config(format!("{name} must be in [0, 1], got {p}")))
    }
}

/// Zero a random rectangle of a (1, C, H, W) state in every channel from
/// `protected` on.
///
/// The rectangle spans between a quarter and a half of each side.
fn damage_item<R: Rng + ?Sized>(item: &Tensor, protected: usize, rng: &mut R) -> Result<Tensor> {
    let (_, c, h, w) = item.dims4()?;
    let rect_h = rng.gen_range((h / 4).max(1)..=(h / 2).max(1));
    let rect_w = rng.gen_range((w / 4).max(1)..=(w / 2).max(1));
    let top = rng.gen_range(0..=h - rect_h);
    let left = rng.gen_range(0..=w - rect_w);

    let plane = h * w;
    let mut mask = vec![1f32; c * plane];
    for channel in protected.min(c)..c {
        for row in top..top + rect_h {
            let start = channel * plane + row * w + left;
            mask[start..start + rect_w].fill(0.0);
        }
    }
    let mask = Tensor::from_vec(mask, (1, c, h, w), item.device())?.to_dtype(item.dtype())?;
    Ok(item.broadcast_mul(&mask)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fix_random_seed;
    use candle_core::{DType, Device, Var};

    /// Number of zeroed cells summed over all channels.
    fn count_zeros(t: &Tensor) -> usize {
        t.eq(0f32)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap() as usize
    }

    fn batch(value: f32, b: usize) -> Tensor {
        Tensor::full(value, (b, 2, 8, 8), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(ReplayPool::new(0, false).is_err());
        assert!(ReplayPool::new(1, false)
            .unwrap()
            .with_replace_probability(1.5)
            .is_err());
    }

    #[test]
    fn test_sample_passes_through_until_full() {
        let mut rng = fix_random_seed(1);
        let mut pool = ReplayPool::new(2, false).unwrap();
        pool.update(&batch(2.0, 4));
        let x = batch(1.0, 4);
        let out = pool.sample(&x, &mut rng).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 4.0 * 128.0);
    }

    #[test]
    fn test_fifo_eviction() {
        let mut pool = ReplayPool::new(3, false).unwrap();
        for k in 0..5 {
            pool.update(&batch(k as f32, 1));
            assert_eq!(pool.len(), (k + 1).min(3));
        }
        let oldest = pool.entries[0].max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(oldest, 2.0);
        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_full_replacement() {
        let mut rng = fix_random_seed(7);
        let mut pool = ReplayPool::new(1, false)
            .unwrap()
            .with_replace_probability(1.0)
            .unwrap();
        pool.update(&batch(3.0, 2));
        let x = batch(1.0, 5);
        let out = pool.sample(&x, &mut rng).unwrap();
        assert_eq!(out.dims(), x.dims());
        let min = out.min_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(min, 3.0);
        // The caller's batch is untouched.
        assert_eq!(x.max_all().unwrap().to_scalar::<f32>().unwrap(), 1.0);
    }

    #[test]
    fn test_damage_zeroes_a_rectangle() {
        let mut rng = fix_random_seed(3);
        let mut pool = ReplayPool::new(1, true)
            .unwrap()
            .with_replace_probability(1.0)
            .unwrap()
            .with_damage_probability(1.0)
            .unwrap();
        pool.update(&batch(1.0, 1));
        let out = pool.sample(&batch(1.0, 3), &mut rng).unwrap();
        for i in 0..3 {
            let zeros = count_zeros(&out.narrow(0, i, 1).unwrap());
            // Per channel between 2x2 and 4x4 cells on an 8x8 grid.
            assert!((2 * 4..=2 * 16).contains(&zeros), "zeros = {zeros}");
        }
    }

    #[test]
    fn test_damage_spares_protected_channels() {
        let mut rng = fix_random_seed(5);
        let mut pool = ReplayPool::new(1, true)
            .unwrap()
            .with_replace_probability(1.0)
            .unwrap()
            .with_damage_probability(1.0)
            .unwrap()
            .with_protected_channels(1);
        pool.update(&batch(1.0, 1));
        let out = pool.sample(&batch(1.0, 2), &mut rng).unwrap();
        assert_eq!(count_zeros(&out.narrow(1, 0, 1).unwrap()), 0);
        assert!(count_zeros(&out.narrow(1, 1, 1).unwrap()) >= 4);
    }

    #[test]
    fn test_stored_entries_are_detached() {
        let var = Var::ones((1, 2, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let prediction = (var.as_tensor() * 2.0).unwrap();
        assert!(prediction.track_op());

        let mut pool = ReplayPool::new(2, false).unwrap();
        pool.update(&prediction);
        assert!(!pool.entries[0].track_op());
    }

    #[test]
    fn test_shape_mismatch() {
        let mut rng = fix_random_seed(0);
        let mut pool = ReplayPool::new(1, false).unwrap();
        pool.update(&Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap());
        assert!(matches!(
            pool.sample(&batch(1.0, 2), &mut rng),
            Err(NcaError::ShapeMismatch { .. })
        ));
    }
}

//! Learning rate schedulers.

use crate::optimizer::NcaOptimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Multiply the learning rate by `gamma` after every step
    Exponential {
        /// Decay factor per step
        gamma: f64,
    },
}

/// Learning rate scheduler.
///
/// ```rust
/// use ncalab_rs::scheduler::{LRScheduler, SchedulerType};
///
/// let mut scheduler = LRScheduler::new(SchedulerType::Exponential { gamma: 0.5 }, 1.0);
/// scheduler.advance();
/// scheduler.advance();
/// assert_eq!(scheduler.get_lr(), 0.25);
/// ```
#[derive(Debug, Clone)]
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base learning rate
    base_lr: f64,
    /// Current step
    current_step: usize,
}

impl LRScheduler {
    /// Create a new scheduler.
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
            current_step: 0,
        }
    }

    /// Exponential decay with factor `gamma` per step.
    pub fn exponential(base_lr: f64, gamma: f64) -> Self {
        Self::new(SchedulerType::Exponential { gamma }, base_lr)
    }

    /// Get learning rate for current step.
    pub fn get_lr(&self) -> f64 {
        match self.scheduler_type {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Exponential { gamma } => {
                self.base_lr * gamma.powi(i32::try_from(self.current_step).unwrap_or(i32::MAX))
            }
        }
    }

    /// Advance the schedule by one step without touching an optimizer.
    pub fn advance(&mut self) {
        self.current_step += 1;
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut NcaOptimizer) {
        self.advance();
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Number of steps taken so far.
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

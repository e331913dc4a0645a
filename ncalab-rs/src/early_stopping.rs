//! Early stopping on a per-epoch validation metric.
//!
//! The trainer calls [`EarlyStopping::step`] once per epoch with the model's
//! validation metric and checks [`EarlyStopping::done`] before starting the
//! next epoch. Once patience is exhausted the tracker stays stopped.
//!
//! # Example
//!
//! ```
//! use ncalab_rs::early_stopping::{EarlyStopping, StoppingDecision};
//!
//! let mut early_stop = EarlyStopping::new(2, 0.0);
//!
//! assert_eq!(early_stop.step(0.80), StoppingDecision::NewBest);
//! early_stop.step(0.79);
//! assert!(!early_stop.done());
//! assert_eq!(early_stop.step(0.80), StoppingDecision::Stop);
//! assert!(early_stop.done());
//! ```

/// Early stopping state tracker.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    /// Number of epochs with no improvement before stopping.
    patience: usize,
    /// Minimum change to qualify as improvement.
    min_delta: f64,
    /// Whether the metric is maximized (accuracy) or minimized (loss).
    mode: StoppingMode,
    /// Best metric value observed so far.
    best_value: f64,
    /// Number of consecutive epochs with no improvement.
    counter: usize,
    /// Whether stopping criterion has been met.
    stopped: bool,
}

/// Metric optimization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoppingMode {
    /// Higher is better (dice, IoU, accuracy).
    #[default]
    Maximize,
    /// Lower is better (loss).
    Minimize,
}

/// Result of feeding a new metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum StoppingDecision {
    /// New best value achieved.
    NewBest,
    /// No improvement, but patience not exhausted.
    NoImprovement {
        /// Number of epochs without improvement.
        count: usize,
        /// Epochs remaining before stopping.
        remaining: usize,
    },
    /// Patience exhausted.
    Stop,
}

impl EarlyStopping {
    /// Create a tracker that maximizes the metric.
    ///
    /// * `patience` - Number of non-improving epochs before stopping
    /// * `min_delta` - Minimum change to qualify as improvement
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            mode: StoppingMode::Maximize,
            best_value: f64::NEG_INFINITY,
            counter: 0,
            stopped: false,
        }
    }

    /// Set the optimization direction (builder pattern).
    pub fn with_mode(mut self, mode: StoppingMode) -> Self {
        self.mode = mode;
        self.best_value = Self::initial_best(mode);
        self
    }

    fn initial_best(mode: StoppingMode) -> f64 {
        match mode {
            StoppingMode::Maximize => f64::NEG_INFINITY,
            StoppingMode::Minimize => f64::INFINITY,
        }
    }

    /// Feed the metric of one epoch.
    ///
    /// Improvement resets the patience counter; anything else increments it.
    /// After the tracker has stopped every call returns
    /// [`StoppingDecision::Stop`] and leaves the state untouched.
    pub fn step(&mut self, value: f64) -> StoppingDecision {
        if self.stopped {
            return StoppingDecision::Stop;
        }

        let improved = match self.mode {
            StoppingMode::Maximize => value - self.best_value > self.min_delta,
            StoppingMode::Minimize => self.best_value - value > self.min_delta,
        };

        if improved {
            self.best_value = value;
            self.counter = 0;
            return StoppingDecision::NewBest;
        }

        self.counter += 1;
        if self.counter >= self.patience {
            self.stopped = true;
            tracing::info!(
                "Early stopping: no improvement over {:.5} for {} epochs",
                self.best_value,
                self.counter
            );
            StoppingDecision::Stop
        } else {
            StoppingDecision::NoImprovement {
                count: self.counter,
                remaining: self.patience - self.counter,
            }
        }
    }

    /// Whether patience has been exhausted.
    pub fn done(&self) -> bool {
        self.stopped
    }

    /// Best value observed so far.
    pub fn best(&self) -> f64 {
        self.best_value
    }

    /// Current number of consecutive non-improving epochs.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Configured patience.
    pub fn patience(&self) -> usize {
        self.patience
    }

    /// Epochs left before stopping.
    pub fn remaining_patience(&self) -> usize {
        if self.stopped {
            0
        } else {
            self.patience.saturating_sub(self.counter)
        }
    }
}

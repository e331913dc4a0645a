//! Trainer configuration parsing and validation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NcaError, Result};

/// Optimization algorithm used by the trainer.
///
/// Parsing is case-insensitive, so `"AdamW"` and `"adamw"` select the same
/// variant. Unknown names are rejected. YAML goes through the same parser.
///
/// ```rust
/// use ncalab_rs::OptimizerMethod;
///
/// let method: OptimizerMethod = "RMSprop".parse().unwrap();
/// assert_eq!(method, OptimizerMethod::RmsProp);
/// assert!("lbfgs".parse::<OptimizerMethod>().is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerMethod {
    /// Adam without weight decay.
    Adam,
    /// Adam with decoupled weight decay.
    #[default]
    AdamW,
    /// Adagrad.
    Adagrad,
    /// Adafactor with factored second moments.
    Adafactor,
    /// RMSprop.
    RmsProp,
    /// SGD with Nesterov momentum.
    Sgd,
}

impl OptimizerMethod {
    /// Every accepted method, in the order used by error messages.
    pub const ALL: [OptimizerMethod; 6] = [
        OptimizerMethod::Adam,
        OptimizerMethod::AdamW,
        OptimizerMethod::Adagrad,
        OptimizerMethod::Adafactor,
        OptimizerMethod::RmsProp,
        OptimizerMethod::Sgd,
    ];

    /// Learning rate used when none is configured.
    #[must_use]
    pub fn default_learning_rate(self) -> f64 {
        match self {
            OptimizerMethod::Adam | OptimizerMethod::AdamW => 16e-4,
            OptimizerMethod::Sgd
            | OptimizerMethod::RmsProp
            | OptimizerMethod::Adagrad
            | OptimizerMethod::Adafactor => 1e-2,
        }
    }

    /// Lowercase name, as accepted by [`FromStr`].
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerMethod::Adam => "adam",
            OptimizerMethod::AdamW => "adamw",
            OptimizerMethod::Adagrad => "adagrad",
            OptimizerMethod::Adafactor => "adafactor",
            OptimizerMethod::RmsProp => "rmsprop",
            OptimizerMethod::Sgd => "sgd",
        }
    }
}

impl fmt::Display for OptimizerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerMethod {
    type Err = NcaError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
                NcaError::Config(format!(
                    "unknown optimizer_method '{s}', expected one of {}",
                    names.join(", ")
                ))
            })
    }
}

impl TryFrom<String> for OptimizerMethod {
    type Error = NcaError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<OptimizerMethod> for String {
    fn from(method: OptimizerMethod) -> Self {
        method.as_str().to_string()
    }
}

/// Hyperparameters of a training run.
///
/// # Example
///
/// ```rust
/// use ncalab_rs::{OptimizerMethod, TrainerConfig};
///
/// let config = TrainerConfig {
///     steps_range: (8, 16),
///     max_epochs: 10,
///     optimizer_method: OptimizerMethod::Sgd,
///     ..Default::default()
/// };
/// config.validate().unwrap();
/// assert_eq!(config.learning_rate(), 1e-2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Clip the global gradient norm to 1.0 before each optimizer step.
    #[serde(default)]
    pub gradient_clipping: bool,

    /// Range of NCA steps per training batch; lower inclusive, upper exclusive.
    #[serde(default = "default_steps_range")]
    pub steps_range: (usize, usize),

    /// Number of NCA steps during validation.
    #[serde(default = "default_steps_validation")]
    pub steps_validation: usize,

    /// Initial learning rate. `None` picks the optimizer's default.
    #[serde(default)]
    pub lr: Option<f64>,

    /// Exponential learning rate decay applied after every batch.
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: f64,

    /// Beta values for Adam and AdamW.
    #[serde(default = "default_adam_betas")]
    pub adam_betas: (f64, f64),

    /// How often each batch is concatenated with itself.
    #[serde(default = "default_batch_repeat")]
    pub batch_repeat: usize,

    /// Maximum number of training epochs.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,

    /// Optimization algorithm.
    #[serde(default)]
    pub optimizer_method: OptimizerMethod,

    /// Seed for step-count sampling, pool sampling and padding noise.
    ///
    /// The stochastic fire mask and parameter initialization use candle's
    /// own generator, which this seed does not control, so two runs with
    /// the same seed are not bit-for-bit identical.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_steps_range() -> (usize, usize) {
    (90, 110)
}
fn default_steps_validation() -> usize {
    100
}
fn default_lr_gamma() -> f64 {
    0.9999
}
fn default_adam_betas() -> (f64, f64) {
    (0.9, 0.99)
}
fn default_batch_repeat() -> usize {
    2
}
fn default_max_epochs() -> usize {
    200
}
fn default_seed() -> u64 {
    42
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            gradient_clipping: false,
            steps_range: default_steps_range(),
            steps_validation: default_steps_validation(),
            lr: None,
            lr_gamma: default_lr_gamma(),
            adam_betas: default_adam_betas(),
            batch_repeat: default_batch_repeat(),
            max_epochs: default_max_epochs(),
            optimizer_method: OptimizerMethod::default(),
            seed: default_seed(),
        }
    }
}

impl TrainerConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Effective initial learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.lr
            .unwrap_or_else(|| self.optimizer_method.default_learning_rate())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`NcaError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.batch_repeat < 1 {
            return Err(NcaError::config("batch_repeat must be >= 1"));
        }
        let (lo, hi) = self.steps_range;
        if lo >= hi {
            return Err(NcaError::Config(format!(
                "steps_range must be strictly increasing, got ({lo}, {hi})"
            )));
        }
        if self.max_epochs == 0 {
            return Err(NcaError::config("max_epochs must be > 0"));
        }
        if self.steps_validation == 0 {
            return Err(NcaError::config("steps_validation must be > 0"));
        }
        if !(self.lr_gamma > 0.0 && self.lr_gamma.is_finite()) {
            return Err(NcaError::Config(format!(
                "lr_gamma must be positive, got {}",
                self.lr_gamma
            )));
        }
        if let Some(lr) = self.lr {
            if !(lr > 0.0 && lr.is_finite()) {
                return Err(NcaError::Config(format!("lr must be positive, got {lr}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.steps_range, (90, 110));
        assert_eq!(config.batch_repeat, 2);
        assert_eq!(config.optimizer_method, OptimizerMethod::AdamW);
        assert_eq!(config.learning_rate(), 16e-4);
    }

    #[test]
    fn test_rejects_bad_batch_repeat() {
        let config = TrainerConfig {
            batch_repeat: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NcaError::Config(_))));
    }

    #[test]
    fn test_rejects_non_increasing_steps_range() {
        for range in [(10, 10), (20, 10)] {
            let config = TrainerConfig {
                steps_range: range,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{range:?} accepted");
        }
    }

    #[test]
    fn test_rejects_zero_epochs() {
        let config = TrainerConfig {
            max_epochs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_learning_rate() {
        let config = TrainerConfig {
            lr: Some(-1.0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_optimizer_parsing_is_case_insensitive() {
        assert_eq!("ADAM".parse::<OptimizerMethod>().unwrap(), OptimizerMethod::Adam);
        assert_eq!(
            "AdaFactor".parse::<OptimizerMethod>().unwrap(),
            OptimizerMethod::Adafactor
        );
        let err = "lion".parse::<OptimizerMethod>().unwrap_err();
        assert!(err.to_string().contains("lion"));
    }

    #[test]
    fn test_default_learning_rates() {
        assert_eq!(OptimizerMethod::Sgd.default_learning_rate(), 1e-2);
        assert_eq!(OptimizerMethod::Adam.default_learning_rate(), 16e-4);
        assert_eq!(OptimizerMethod::RmsProp.default_learning_rate(), 1e-2);
        assert_eq!(OptimizerMethod::Adagrad.default_learning_rate(), 1e-2);
        assert_eq!(OptimizerMethod::Adafactor.default_learning_rate(), 1e-2);
    }

    #[test]
    fn test_explicit_lr_wins() {
        let config = TrainerConfig {
            lr: Some(3e-4),
            optimizer_method: OptimizerMethod::Sgd,
            ..Default::default()
        };
        assert_eq!(config.learning_rate(), 3e-4);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = TrainerConfig {
            steps_range: (32, 64),
            optimizer_method: OptimizerMethod::RmsProp,
            gradient_clipping: true,
            ..Default::default()
        };
        let file = NamedTempFile::new().unwrap();
        config.to_file(file.path()).unwrap();
        let restored = TrainerConfig::from_file(file.path()).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let config: TrainerConfig =
            serde_yaml::from_str("max_epochs: 5\noptimizer_method: sgd\n").unwrap();
        assert_eq!(config.max_epochs, 5);
        assert_eq!(config.optimizer_method, OptimizerMethod::Sgd);
        assert_eq!(config.steps_validation, 100);
    }

    #[test]
    fn test_yaml_optimizer_name_is_case_insensitive() {
        for (name, method) in [
            ("AdamW", OptimizerMethod::AdamW),
            ("RMSprop", OptimizerMethod::RmsProp),
            ("SGD", OptimizerMethod::Sgd),
        ] {
            let config: TrainerConfig =
                serde_yaml::from_str(&format!("optimizer_method: {name}\n")).unwrap();
            assert_eq!(config.optimizer_method, method);
        }

        let yaml = serde_yaml::to_string(&TrainerConfig::default()).unwrap();
        assert!(yaml.contains("optimizer_method: adamw"));
    }

    #[test]
    fn test_yaml_unknown_optimizer_is_rejected() {
        let result: std::result::Result<TrainerConfig, _> =
            serde_yaml::from_str("optimizer_method: lbfgs\n");
        assert!(result.is_err());
    }
}

//! Result record of a training run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome of [`Trainer::train`](crate::trainer::Trainer::train).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    best_accuracy: f64,
    best_model_path: Option<PathBuf>,
    best_training_loss: f64,
    test_metrics: BTreeMap<String, f64>,
}

impl TrainingSummary {
    /// Assemble a summary.
    pub fn new(
        best_accuracy: f64,
        best_model_path: Option<PathBuf>,
        best_training_loss: f64,
        test_metrics: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            best_accuracy,
            best_model_path,
            best_training_loss,
            test_metrics,
        }
    }

    /// Best value of the model's validation metric, 0 if never validated.
    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    /// Checkpoint of the best model, if a model path was configured.
    pub fn best_model_path(&self) -> Option<&Path> {
        self.best_model_path.as_deref()
    }

    /// Lowest mean epoch training loss.
    pub fn best_training_loss(&self) -> f64 {
        self.best_training_loss
    }

    /// Metrics on the test set, averaged over its batches.
    pub fn test_metrics(&self) -> &BTreeMap<String, f64> {
        &self.test_metrics
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for TrainingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Best validation accuracy: {:.5}", self.best_accuracy)?;
        match &self.best_model_path {
            Some(path) => writeln!(f, "Best model path: {}", path.display())?,
            None => writeln!(f, "Best model path: -")?,
        }
        write!(f, "Best training loss: {:.5}", self.best_training_loss)?;
        for (name, value) in &self.test_metrics {
            write!(f, "\nTest {name}: {value:.5}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> TrainingSummary {
        TrainingSummary::new(
            0.8,
            Some(PathBuf::from("model.best.safetensors")),
            0.0125,
            BTreeMap::from([("dice".to_string(), 0.75)]),
        )
    }

    #[test]
    fn test_accessors() {
        let summary = summary();
        assert_eq!(summary.best_accuracy(), 0.8);
        assert_eq!(
            summary.best_model_path(),
            Some(Path::new("model.best.safetensors"))
        );
        assert_eq!(summary.best_training_loss(), 0.0125);
        assert_eq!(summary.test_metrics()["dice"], 0.75);
    }

    #[test]
    fn test_display() {
        let text = summary().to_string();
        assert!(text.contains("Best validation accuracy: 0.80000"));
        assert!(text.contains("Test dice: 0.75000"));
    }

    #[test]
    fn test_json() {
        let summary = summary();
        let json = summary.to_json().unwrap();
        let parsed: TrainingSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, summary);
    }
}

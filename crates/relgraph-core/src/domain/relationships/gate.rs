//! Confidence gate
//!
//! Classifies every proposal before it can reach the store.

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    AutoAccept,
    Review,
    Discard,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceGate {
    accept_threshold: f32,
    review_threshold: f32,
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self::new(&GateConfig::default())
    }
}

impl ConfidenceGate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            accept_threshold: config.accept_threshold,
            review_threshold: config.review_threshold,
        }
    }

    /// Bands: `>= accept` auto-accepts, `[review, accept)` goes to review, the rest is
    /// discarded. Non-finite confidences are discarded.
    pub fn classify(&self, confidence: f32) -> GateDecision {
        if !confidence.is_finite() {
            return GateDecision::Discard;
        }
        if confidence >= self.accept_threshold {
            GateDecision::AutoAccept
        } else if confidence >= self.review_threshold {
            GateDecision::Review
        } else {
            GateDecision::Discard
        }
    }

    pub fn accept_threshold(&self) -> f32 {
        self.accept_threshold
    }

    pub fn review_threshold(&self) -> f32 {
        self.review_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bands() {
        let gate = ConfidenceGate::default();
        assert_eq!(gate.classify(1.0), GateDecision::AutoAccept);
        assert_eq!(gate.classify(0.88), GateDecision::AutoAccept);
        assert_eq!(gate.classify(0.80), GateDecision::AutoAccept);
        assert_eq!(gate.classify(0.79), GateDecision::Review);
        assert_eq!(gate.classify(0.65), GateDecision::Review);
        assert_eq!(gate.classify(0.60), GateDecision::Review);
        assert_eq!(gate.classify(0.59), GateDecision::Discard);
        assert_eq!(gate.classify(0.0), GateDecision::Discard);
    }

    #[test]
    fn test_non_finite_discarded() {
        let gate = ConfidenceGate::default();
        assert_eq!(gate.classify(f32::NAN), GateDecision::Discard);
        assert_eq!(gate.classify(f32::INFINITY), GateDecision::Discard);
    }

    #[test]
    fn test_custom_thresholds() {
        let gate = ConfidenceGate::new(&GateConfig {
            accept_threshold: 0.9,
            review_threshold: 0.7,
        });
        assert_eq!(gate.classify(0.85), GateDecision::Review);
        assert_eq!(gate.classify(0.65), GateDecision::Discard);
    }
}

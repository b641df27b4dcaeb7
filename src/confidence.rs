//! Confidence gate shared by every layer of the escalation ladder.

/// Outcome of gating a raw confidence signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    /// Normalized confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether the confidence clears the configured threshold.
    pub passed: bool,
}

/// Maps a method's raw signal to a normalized confidence and a pass/fail decision.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceGate {
    threshold: f64,
}

impl ConfidenceGate {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: normalize(threshold),
        }
    }

    pub fn evaluate(&self, raw: f64) -> GateDecision {
        let confidence = normalize(raw);
        GateDecision {
            confidence,
            passed: confidence >= self.threshold,
        }
    }

    pub fn passes(&self, raw: f64) -> bool {
        self.evaluate(raw).passed
    }
}

/// Clamp into `[0, 1]`; NaN becomes 0.
pub fn normalize(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Mean of the given factors, or `baseline` when there are none.
pub fn mean_or(factors: &[f64], baseline: f64) -> f64 {
    if factors.is_empty() {
        return normalize(baseline);
    }
    normalize(factors.iter().sum::<f64>() / factors.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_clamps_and_decides() {
        let gate = ConfidenceGate::new(0.8);
        assert_eq!(gate.evaluate(1.7).confidence, 1.0);
        assert!(gate.evaluate(1.7).passed);
        assert_eq!(gate.evaluate(-0.2).confidence, 0.0);
        assert!(!gate.passes(0.79));
        assert!(gate.passes(0.8));
    }

    #[test]
    fn test_nan_is_zero() {
        let gate = ConfidenceGate::new(0.5);
        let decision = gate.evaluate(f64::NAN);
        assert_eq!(decision.confidence, 0.0);
        assert!(!decision.passed);
    }

    #[test]
    fn test_mean_or_baseline() {
        assert_eq!(mean_or(&[], 0.5), 0.5);
        assert!((mean_or(&[0.9, 0.85, 0.85], 0.5) - 0.8667).abs() < 1e-3);
    }
}

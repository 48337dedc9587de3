//! Detection results as published to observers.
//!
//! Counts and statistics are authoritative from the remote service. The client
//! only ever replaces them with the latest values it receives (or zeroes them
//! after a successful reset); it never adds them up itself.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-class counts. The remote service names the classes `sin_chaleco`
/// (no safety vest) and `con_chaleco` (vest worn).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    #[serde(rename = "sin_chaleco", alias = "violation", default)]
    pub violation: u64,
    #[serde(rename = "con_chaleco", alias = "compliant", default)]
    pub compliant: u64,
}

impl ClassCounts {
    pub const ZERO: ClassCounts = ClassCounts {
        violation: 0,
        compliant: 0,
    };

    pub fn new(violation: u64, compliant: u64) -> Self {
        Self {
            violation,
            compliant,
        }
    }
}

/// Outcome of one processed frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub detected: bool,
    pub class_label: String,
    /// Clamped to `[0, 1]`.
    pub confidence: f32,
    pub current_counts: ClassCounts,
    pub cumulative_statistics: ClassCounts,
    /// Annotated JPEG returned by the service, if any.
    pub annotated_image: Option<Arc<[u8]>>,
}

/// Coarse verdict for a result, used by consumers to colour their display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Searching,
    Violation,
    Compliant,
    Other,
}

impl DetectionResult {
    pub fn verdict(&self) -> Verdict {
        if !self.detected {
            return Verdict::Searching;
        }
        let label = self.class_label.to_lowercase();
        if label.contains("sin_chaleco") || self.current_counts.violation > 0 {
            Verdict::Violation
        } else if label.contains("con_chaleco") || self.current_counts.compliant > 0 {
            Verdict::Compliant
        } else {
            Verdict::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_use_service_field_names() {
        let counts: ClassCounts =
            serde_json::from_str(r#"{"sin_chaleco": 3, "con_chaleco": 5}"#).expect("counts");
        assert_eq!(counts, ClassCounts::new(3, 5));

        let aliased: ClassCounts =
            serde_json::from_str(r#"{"violation": 1, "compliant": 2}"#).expect("aliased");
        assert_eq!(aliased, ClassCounts::new(1, 2));

        let json = serde_json::to_string(&ClassCounts::new(1, 0)).expect("serialize");
        assert_eq!(json, r#"{"sin_chaleco":1,"con_chaleco":0}"#);
    }

    #[test]
    fn verdict_prefers_violation() {
        let mut result = DetectionResult {
            detected: true,
            class_label: "Detecciones".to_string(),
            current_counts: ClassCounts::new(1, 2),
            ..DetectionResult::default()
        };
        assert_eq!(result.verdict(), Verdict::Violation);

        result.current_counts = ClassCounts::new(0, 2);
        assert_eq!(result.verdict(), Verdict::Compliant);

        result.detected = false;
        assert_eq!(result.verdict(), Verdict::Searching);
    }
}

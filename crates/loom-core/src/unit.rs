//! Work units and their analysis results.

use serde::{Deserialize, Serialize};

/// Element ids a unit is linked to, per dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedElements {
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub implementation: Vec<String>,
}

impl LinkedElements {
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && self.implementation.is_empty()
    }
}

/// One independently processable item. Not mutated while it is being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub linked: LinkedElements,
}

/// Scored outcome for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub unit_id: String,
    pub label: String,
    /// Always within [-1, 1].
    pub polarity: f64,
    pub rationale: String,
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl AnalysisResult {
    pub fn new(unit: &WorkUnit, polarity: f64, rationale: impl Into<String>, gaps: Vec<String>) -> Self {
        Self {
            unit_id: unit.id.clone(),
            label: unit.label.clone(),
            polarity: clamp_polarity(polarity),
            rationale: rationale.into(),
            gaps,
        }
    }
}

/// Clamps into [-1, 1]; NaN and infinities map to -1.
pub fn clamp_polarity(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(-1.0, 1.0)
    } else {
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range() {
        assert_eq!(clamp_polarity(5.0), 1.0);
        assert_eq!(clamp_polarity(-99.0), -1.0);
        assert_eq!(clamp_polarity(0.3), 0.3);
    }

    #[test]
    fn non_finite_is_negative_one() {
        assert_eq!(clamp_polarity(f64::NAN), -1.0);
        assert_eq!(clamp_polarity(f64::INFINITY), -1.0);
    }

    #[test]
    fn result_constructor_clamps() {
        let unit = WorkUnit {
            id: "c1".into(),
            label: "Auth".into(),
            content: String::new(),
            linked: LinkedElements::default(),
        };
        let result = AnalysisResult::new(&unit, 7.5, "overclaimed", vec![]);
        assert_eq!(result.polarity, 1.0);
        assert_eq!(result.unit_id, "c1");
    }
}

use crate::models::{EstimatedRisk, ProposedAction, Severity};

/// Gate predicate deciding whether a set of proposed fixes needs a human
/// decision before anything touches the repository. Thresholds are plain
/// data so deployments can tighten or relax the gate without code changes.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    /// Severities that always require review.
    pub gated_severities: Vec<Severity>,
    /// Risk estimates that always require review.
    pub gated_risks: Vec<EstimatedRisk>,
    /// Actions below this confidence require review.
    pub min_confidence: u8,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            gated_severities: vec![Severity::Critical, Severity::High],
            gated_risks: vec![EstimatedRisk::High],
            min_confidence: 70,
        }
    }
}

impl ApprovalPolicy {
    /// True iff at least one action trips a gate. An empty proposal set never
    /// needs review.
    pub fn requires_review(&self, actions: &[ProposedAction]) -> bool {
        actions.iter().any(|action| {
            self.gated_severities.contains(&action.severity)
                || self.gated_risks.contains(&action.estimated_risk)
                || action.confidence < self.min_confidence
        })
    }
}

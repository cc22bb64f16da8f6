// Assembly stages and the trail of transitions through them

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

/// Sequence number within one trail
pub type SequenceNumber = u32;

/// Linear pipeline a submission moves through. `Rejected` is terminal and
/// reachable from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStage {
    Received,
    Normalized,
    Prioritized,
    Deduplicated,
    Assembled,
    Persisted,
    Rejected,
}

impl AssemblyStage {
    /// The stage that legally follows this one on the success path.
    pub fn next(&self) -> Option<AssemblyStage> {
        match self {
            AssemblyStage::Received => Some(AssemblyStage::Normalized),
            AssemblyStage::Normalized => Some(AssemblyStage::Prioritized),
            AssemblyStage::Prioritized => Some(AssemblyStage::Deduplicated),
            AssemblyStage::Deduplicated => Some(AssemblyStage::Assembled),
            AssemblyStage::Assembled => Some(AssemblyStage::Persisted),
            AssemblyStage::Persisted | AssemblyStage::Rejected => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AssemblyStage::Persisted | AssemblyStage::Rejected)
    }
}

impl std::fmt::Display for AssemblyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AssemblyStage::Received => "received",
            AssemblyStage::Normalized => "normalized",
            AssemblyStage::Prioritized => "prioritized",
            AssemblyStage::Deduplicated => "deduplicated",
            AssemblyStage::Assembled => "assembled",
            AssemblyStage::Persisted => "persisted",
            AssemblyStage::Rejected => "rejected",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTransition {
    pub seq: SequenceNumber,
    pub stage: AssemblyStage,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ordered record of every stage a submission reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageTrail {
    #[serde(skip)]
    next_seq: SequenceNumber,
    transitions: Vec<StageTransition>,
}

impl StageTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get next sequence number
    fn next_seq(&mut self) -> SequenceNumber {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Records a success-path transition. Out-of-order stages are recorded
    /// but logged, since they indicate a pipeline defect.
    pub fn advance(&mut self, stage: AssemblyStage, detail: Option<String>) {
        let expected = match self.current() {
            None => Some(AssemblyStage::Received),
            Some(current) => current.next(),
        };
        if expected != Some(stage) {
            warn!(
                "stage {} recorded out of order (expected {:?})",
                stage, expected
            );
        }
        match &detail {
            Some(detail) => info!("submission {}: {}", stage, detail),
            None => info!("submission {}", stage),
        }
        self.push(stage, detail);
    }

    /// Moves to the terminal `Rejected` stage.
    pub fn reject(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(
            "submission rejected after {}: {}",
            self.current()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "start".to_string()),
            reason
        );
        self.push(AssemblyStage::Rejected, Some(reason));
    }

    fn push(&mut self, stage: AssemblyStage, detail: Option<String>) {
        let seq = self.next_seq();
        self.transitions.push(StageTransition {
            seq,
            stage,
            at: Utc::now(),
            detail,
        });
    }

    pub fn current(&self) -> Option<AssemblyStage> {
        self.transitions.last().map(|t| t.stage)
    }

    pub fn transitions(&self) -> &[StageTransition] {
        &self.transitions
    }

    pub fn stages(&self) -> Vec<AssemblyStage> {
        self.transitions.iter().map(|t| t.stage).collect()
    }

    pub fn is_rejected(&self) -> bool {
        self.current() == Some(AssemblyStage::Rejected)
    }

    /// Last stage reached before rejection, if rejected.
    pub fn rejected_after(&self) -> Option<AssemblyStage> {
        if !self.is_rejected() {
            return None;
        }
        self.transitions
            .iter()
            .rev()
            .nth(1)
            .map(|t| t.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_linear() {
        let mut trail = StageTrail::new();
        let mut stage = Some(AssemblyStage::Received);
        while let Some(s) = stage {
            trail.advance(s, None);
            stage = s.next();
        }
        assert_eq!(
            trail.stages(),
            vec![
                AssemblyStage::Received,
                AssemblyStage::Normalized,
                AssemblyStage::Prioritized,
                AssemblyStage::Deduplicated,
                AssemblyStage::Assembled,
                AssemblyStage::Persisted,
            ]
        );
        assert!(trail.current().unwrap().is_terminal());
        let seqs: Vec<u32> = trail.transitions().iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejection_records_last_stage() {
        let mut trail = StageTrail::new();
        trail.advance(AssemblyStage::Received, None);
        trail.advance(AssemblyStage::Normalized, Some("2 rules".to_string()));
        trail.reject("duplicate");
        assert!(trail.is_rejected());
        assert_eq!(trail.rejected_after(), Some(AssemblyStage::Normalized));
        assert_eq!(
            trail.transitions().last().unwrap().detail.as_deref(),
            Some("duplicate")
        );
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let mut trail = StageTrail::new();
        trail.advance(AssemblyStage::Received, None);
        trail.advance(AssemblyStage::Normalized, None);
        let t = trail.transitions();
        assert!(t[0].at <= t[1].at);
    }
}

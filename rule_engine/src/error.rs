// Error taxonomy for collection assembly

use crate::rule_metadata::{GroupType, RuleId, SourceApplicationId};
use crate::validation::ValidationErrors;
use thiserror::Error;

/// Failures reported by a storage collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Storage backend failure: {0}")]
    Backend(String),

    /// A uniqueness constraint rejected the write.
    #[error("Storage conflict: {0}")]
    Conflict(String),

    #[error("Record not found")]
    NotFound,
}

/// What a conflicting entry collides with.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictTarget {
    /// A rule already held by the store.
    Stored(RuleId),
    /// An earlier entry of the same submission.
    InSubmission {
        group_type: GroupType,
        rule_index: usize,
        rule_name: String,
    },
    /// Raised by the store's uniqueness constraint at persist time.
    Constraint,
}

/// One conflicting entry inside a rejected submission.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateConflict {
    pub group_type: GroupType,
    pub rule_index: usize,
    pub rule_name: String,
    pub target: ConflictTarget,
}

impl DuplicateConflict {
    /// Stored rule holding the fingerprint, when there is one.
    pub fn existing_rule_id(&self) -> Option<RuleId> {
        match self.target {
            ConflictTarget::Stored(id) => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for DuplicateConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.rules[{}] '{}' ",
            self.group_type.document_key(),
            self.rule_index,
            self.rule_name
        )?;
        match &self.target {
            ConflictTarget::Stored(existing) => write!(f, "duplicates rule {}", existing),
            ConflictTarget::InSubmission {
                group_type,
                rule_index,
                rule_name,
            } => write!(
                f,
                "duplicates {}.rules[{}] '{}' in the same submission",
                group_type.document_key(),
                rule_index,
                rule_name
            ),
            ConflictTarget::Constraint => write!(f, "duplicates an existing rule"),
        }
    }
}

/// Semantic duplicates found in a submission. Lists every conflicting entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DuplicateRuleError {
    pub conflicts: Vec<DuplicateConflict>,
}

impl DuplicateRuleError {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn push(&mut self, conflict: DuplicateConflict) {
        self.conflicts.push(conflict);
    }
}

impl std::fmt::Display for DuplicateRuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} duplicate rule(s): ", self.conflicts.len())?;
        for (i, conflict) in self.conflicts.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", conflict)?;
        }
        Ok(())
    }
}

impl std::error::Error for DuplicateRuleError {}

/// Everything that can reject a submission.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AssemblyError {
    /// Malformed input. User-correctable; carries every violation.
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Duplicate rules: {0}")]
    Duplicate(DuplicateRuleError),

    /// No room left above the highest assigned priority.
    #[error(
        "Priority exhausted for {} collections{}: highest assigned is {}, ceiling is {}",
        .group_type,
        application_suffix(.source_application),
        .highest,
        .ceiling
    )]
    PriorityExhausted {
        group_type: GroupType,
        source_application: Option<SourceApplicationId>,
        highest: u32,
        ceiling: u32,
    },

    /// Internal invariant broken while building or reading a document.
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

fn application_suffix(source: &Option<SourceApplicationId>) -> String {
    source
        .as_ref()
        .map(|s| format!(" of application {}", s))
        .unwrap_or_default()
}

impl From<ValidationErrors> for AssemblyError {
    fn from(errors: ValidationErrors) -> Self {
        AssemblyError::Validation(errors)
    }
}

impl From<DuplicateRuleError> for AssemblyError {
    fn from(err: DuplicateRuleError) -> Self {
        AssemblyError::Duplicate(err)
    }
}

impl AssemblyError {
    /// Whether the caller can fix the submission and resubmit.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, AssemblyError::Validation(_) | AssemblyError::Duplicate(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_error_lists_every_conflict() {
        let existing = RuleId::new();
        let mut err = DuplicateRuleError::default();
        err.push(DuplicateConflict {
            group_type: GroupType::Network,
            rule_index: 1,
            rule_name: "allow-db".to_string(),
            target: ConflictTarget::Stored(existing),
        });
        err.push(DuplicateConflict {
            group_type: GroupType::Nat,
            rule_index: 0,
            rule_name: "dnat-web".to_string(),
            target: ConflictTarget::Constraint,
        });
        err.push(DuplicateConflict {
            group_type: GroupType::Application,
            rule_index: 2,
            rule_name: "web-copy".to_string(),
            target: ConflictTarget::InSubmission {
                group_type: GroupType::Application,
                rule_index: 0,
                rule_name: "web".to_string(),
            },
        });

        let text = err.to_string();
        assert!(text.starts_with("3 duplicate rule(s)"));
        assert!(text.contains("network_rules.rules[1] 'allow-db'"));
        assert!(text.contains(&existing.to_string()));
        assert!(text.contains("nat_rules.rules[0]"));
        assert!(text.contains("duplicates application_rules.rules[0] 'web' in the same submission"));
        assert_eq!(err.conflicts[0].existing_rule_id(), Some(existing));
        assert_eq!(err.conflicts[2].existing_rule_id(), None);
    }

    #[test]
    fn priority_exhausted_mentions_application() {
        let err = AssemblyError::PriorityExhausted {
            group_type: GroupType::Application,
            source_application: Some(SourceApplicationId::new("app-7")),
            highest: 65000,
            ceiling: 65000,
        };
        let text = err.to_string();
        assert!(text.contains("APPLICATION"));
        assert!(text.contains("app-7"));
        assert!(!err.is_user_correctable());
    }

    #[test]
    fn store_error_converts() {
        let err: AssemblyError = StoreError::NotFound.into();
        assert_eq!(err, AssemblyError::Storage(StoreError::NotFound));
    }
}

// Collection assembly orchestration
//
// Received -> Normalized -> Prioritized -> Deduplicated -> Assembled -> Persisted
//
// Any failure moves the submission to Rejected. Every read of existing
// state and every write happens inside one ledger session, so either the
// whole submission is persisted or nothing is. Failures are deterministic
// given the input and existing state; nothing is retried.

use crate::document::{CollectionDocument, ResolvedRuleGroup};
use crate::error::{
    AssemblyError, ConflictTarget, DuplicateConflict, DuplicateRuleError, StoreError,
};
use crate::fingerprint::{compute_request_hash, AcceptedRule, DuplicateDetector, Fingerprint};
use crate::ledger::{Ledger, LedgerSession};
use crate::normalize::{
    check_group_references, normalize, resolve_address_groups, Submission, SubmissionInput,
};
use crate::priority::{Priority, PriorityResolver};
use crate::record::CollectionRecord;
use crate::rule_metadata::{CollectionId, GroupType, RuleId};
use crate::stage::{AssemblyStage, StageTrail};
use crate::validation::ValidationErrors;
use chrono::Utc;
use log::{info, warn};

// ================================================================================================
// CONFIGURATION
// ================================================================================================

/// Priority assignment settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Highest priority that may be assigned automatically
    pub ceiling: u32,
    /// Gap between consecutive automatic priorities
    pub increment: u32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ceiling: Priority::MAX,
            increment: Priority::STEP,
        }
    }
}

// ================================================================================================
// RECEIPT
// ================================================================================================

/// What the caller gets back for an accepted submission.
#[derive(Debug, Clone)]
pub struct AssemblyReceipt {
    pub collection_id: CollectionId,
    pub document: CollectionDocument,
    /// SHA-256 of the compact document JSON
    pub document_digest: String,
    /// SHA-256 over the sorted entry fingerprints
    pub request_hash: Option<String>,
    pub rules: Vec<AcceptedRule>,
    pub trail: StageTrail,
}

impl AssemblyReceipt {
    pub fn priority(&self, group_type: GroupType) -> Option<Priority> {
        self.document.group(group_type).map(|g| g.priority)
    }

    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.iter().map(|r| r.rule_id).collect()
    }
}

// ================================================================================================
// ASSEMBLER
// ================================================================================================

pub struct CollectionAssembler<L: Ledger> {
    ledger: L,
    config: AssemblerConfig,
    resolver: PriorityResolver,
}

impl<L: Ledger> CollectionAssembler<L> {
    pub fn new(ledger: L) -> Self {
        Self::with_config(ledger, AssemblerConfig::default())
    }

    pub fn with_config(ledger: L, config: AssemblerConfig) -> Self {
        let resolver = PriorityResolver::new(&config);
        Self {
            ledger,
            config,
            resolver,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Validates, prioritizes, deduplicates, assembles and persists one submission.
    pub fn assemble(&self, input: &SubmissionInput) -> Result<AssemblyReceipt, AssemblyError> {
        self.assemble_with_trail(input).0
    }

    /// Like [`assemble`](Self::assemble), also returning the stage trail on failure.
    pub fn assemble_with_trail(
        &self,
        input: &SubmissionInput,
    ) -> (Result<AssemblyReceipt, AssemblyError>, StageTrail) {
        let mut trail = StageTrail::new();
        trail.advance(AssemblyStage::Received, None);

        let result = match normalize(input) {
            Ok(submission) => {
                trail.advance(AssemblyStage::Normalized, Some(describe(&submission)));
                self.run(submission, &mut trail)
            }
            Err(mut errors) => {
                errors.merge(self.undefined_groups(input));
                Err(AssemblyError::Validation(errors))
            }
        };
        finish(result, trail)
    }

    /// Undefined address-group references in a submission that failed
    /// normalization. The session is only read and is rolled back.
    fn undefined_groups(&self, input: &SubmissionInput) -> ValidationErrors {
        let checked = self
            .ledger
            .begin()
            .and_then(|session| check_group_references(input, &session));
        match checked {
            Ok(errors) => errors,
            Err(e) => {
                warn!("could not check address-group references: {}", e);
                ValidationErrors::new()
            }
        }
    }

    /// Entry point for submissions that were normalized elsewhere.
    pub fn assemble_normalized(
        &self,
        submission: Submission,
    ) -> Result<AssemblyReceipt, AssemblyError> {
        let mut trail = StageTrail::new();
        trail.advance(AssemblyStage::Received, None);
        trail.advance(AssemblyStage::Normalized, Some(describe(&submission)));
        let result = self.run(submission, &mut trail);
        finish(result, trail).0
    }

    fn run(
        &self,
        submission: Submission,
        trail: &mut StageTrail,
    ) -> Result<AssemblyReceipt, AssemblyError> {
        let mut session = self.ledger.begin()?;
        let source = submission.source_application.as_ref();

        let addresses = resolve_address_groups(&submission, &session)?;

        let mut resolved = Vec::new();
        for group in submission.groups() {
            let priority =
                self.resolver
                    .resolve(&session, group.group_type, source, group.priority)?;
            resolved.push(ResolvedRuleGroup {
                group_type: group.group_type,
                action: group.action,
                priority,
                rules: group.rules.clone(),
            });
        }
        let assigned: Vec<String> = resolved
            .iter()
            .map(|g| format!("{}={}", g.group_type, g.priority))
            .collect();
        trail.advance(AssemblyStage::Prioritized, Some(assigned.join(", ")));

        let detector = DuplicateDetector::new(source, &addresses);
        let accepted = detector.check(&session, submission.groups())?;
        trail.advance(
            AssemblyStage::Deduplicated,
            Some(format!("{} unique rule(s)", accepted.len())),
        );

        let document = CollectionDocument::assemble(&submission, resolved, &addresses)?;
        let document_digest = document.digest()?;
        let fingerprints: Vec<Fingerprint> =
            accepted.iter().map(|r| r.fingerprint.clone()).collect();
        let request_hash = compute_request_hash(&fingerprints);
        trail.advance(
            AssemblyStage::Assembled,
            Some(format!("document digest {}", document_digest)),
        );

        let record = CollectionRecord {
            id: CollectionId::new(),
            collection_name: submission.collection_name.clone(),
            source_application: submission.source_application.clone(),
            application_name: submission.application_name.clone(),
            requested_by: submission.requested_by.clone(),
            document,
            document_digest,
            request_hash,
            rules: accepted,
            address_groups: submission.ip_groups.clone(),
            created_at: Utc::now(),
        };
        let collection_id = persist_record(&mut session, &detector, &record)?;
        session.commit()?;

        info!(
            "persisted collection '{}' as {} ({} rule(s))",
            record.collection_name,
            collection_id,
            record.rules.len()
        );
        trail.advance(AssemblyStage::Persisted, Some(collection_id.to_string()));

        Ok(AssemblyReceipt {
            collection_id,
            document: record.document,
            document_digest: record.document_digest,
            request_hash: record.request_hash,
            rules: record.rules,
            trail: StageTrail::new(),
        })
    }
}

/// Writes the record and records every fingerprint. A uniqueness conflict
/// raised by the store on a fingerprint is reported as a duplicate.
fn persist_record<S: LedgerSession>(
    session: &mut S,
    detector: &DuplicateDetector<'_>,
    record: &CollectionRecord,
) -> Result<CollectionId, AssemblyError> {
    let collection_id = session.persist(record)?;
    for rule in &record.rules {
        let scope = detector.scope(rule.group_type);
        match session.record(&rule.fingerprint, &scope, rule.rule_id) {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                warn!("fingerprint conflict on '{}': {}", rule.rule_name, reason);
                return Err(AssemblyError::Duplicate(DuplicateRuleError {
                    conflicts: vec![DuplicateConflict {
                        group_type: rule.group_type,
                        rule_index: rule.rule_index,
                        rule_name: rule.rule_name.clone(),
                        target: ConflictTarget::Constraint,
                    }],
                }));
            }
            Err(other) => return Err(other.into()),
        }
    }
    Ok(collection_id)
}

fn describe(submission: &Submission) -> String {
    format!(
        "collection '{}' with {} rule(s)",
        submission.collection_name,
        submission.rule_count()
    )
}

fn finish(
    result: Result<AssemblyReceipt, AssemblyError>,
    mut trail: StageTrail,
) -> (Result<AssemblyReceipt, AssemblyError>, StageTrail) {
    match result {
        Ok(mut receipt) => {
            receipt.trail = trail.clone();
            (Ok(receipt), trail)
        }
        Err(err) => {
            trail.reject(err.to_string());
            (Err(err), trail)
        }
    }
}

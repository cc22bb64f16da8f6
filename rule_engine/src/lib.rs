pub mod rule_metadata;
pub mod rule_entry;
pub mod validation;
pub mod normalize;
pub mod priority;
pub mod fingerprint;
pub mod document;
pub mod stage;
pub mod record;
pub mod ledger;
pub mod assembler;
pub mod memory;
pub mod access;
pub mod error;

pub use rule_metadata::{
    CollectionId, CollectionName, GroupType, RuleAction, RuleId, SourceApplicationId,
};

pub use rule_entry::{
    ApplicationProtocol, ApplicationProtocolType, ApplicationRule, NatProtocol, NatRule,
    NetworkProtocol, NetworkRule, PortSpec, RuleEntry, RuleHeader,
};

pub use validation::{
    Violation,              // Single field-level problem
    ValidationErrors,       // Collect-all violation list
};

pub use normalize::{
    check_group_references, // Undefined group references in raw input
    normalize,              // Raw submission -> normalized submission
    resolve_address_groups, // Store-aware address-group pass
    AddressGroupDirectory,  // Lookup of stored address groups
    AddressGroups,          // Submission-defined groups
    ResolvedAddressGroups,  // Everything a submission can reference
    RuleGroup,              // Validated group before prioritization
    RuleGroupInput,         // Raw group payload
    RuleInput,              // Raw rule payload
    Submission,             // Normalized submission
    SubmissionInput,        // Raw submission payload
};

pub use priority::{Priority, PriorityOracle, PriorityResolver};

pub use fingerprint::{
    canonical_form, compute_fingerprint, compute_request_hash, AcceptedRule, DuplicateDetector,
    DuplicateIndex, DuplicateScope, Fingerprint,
};

pub use document::{entry_from_value, entry_to_value, CollectionDocument, ResolvedRuleGroup};

pub use stage::{AssemblyStage, StageTrail, StageTransition};

pub use record::{
    CollectionRecord, CollectionStatus, CollectionSummary, LedgerStats, StoredCollection,
};

pub use ledger::{
    CollectionCatalog,      // Read/withdraw/stats over stored collections
    CollectionStore,        // Atomic persistence
    Ledger,                 // Session factory
    LedgerSession,          // One serializable unit of work
};

pub use assembler::{AssemblerConfig, AssemblyReceipt, CollectionAssembler};

pub use memory::{MemoryLedger, MemorySession};

pub use access::AccessPolicy;

pub use error::{AssemblyError, ConflictTarget, DuplicateConflict, DuplicateRuleError, StoreError};

// Content fingerprints and duplicate detection
//
// A fingerprint is a SHA-256 digest over a canonical string of one rule's
// semantically significant fields. Names and free-text annotations are
// excluded, address-group references are expanded to their members, and
// unordered fields are sorted. Application protocol:port pairs keep their
// submission order.

use crate::error::{
    AssemblyError, ConflictTarget, DuplicateConflict, DuplicateRuleError, StoreError,
};
use crate::normalize::{ResolvedAddressGroups, RuleGroup};
use crate::rule_entry::RuleEntry;
use crate::rule_metadata::{GroupType, RuleId, SourceApplicationId};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const COMPONENT_SEPARATOR: &str = "::";
const LIST_SEPARATOR: &str = "|";

/// Lowercase hex SHA-256 of a rule's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Duplicates are only detected within one source application and group type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DuplicateScope {
    pub source_application: Option<SourceApplicationId>,
    pub group_type: GroupType,
}

impl DuplicateScope {
    pub fn new(source_application: Option<SourceApplicationId>, group_type: GroupType) -> Self {
        Self {
            source_application,
            group_type,
        }
    }
}

/// Fingerprint lookup and recording.
pub trait DuplicateIndex {
    fn find(
        &self,
        fingerprint: &Fingerprint,
        scope: &DuplicateScope,
    ) -> Result<Option<RuleId>, StoreError>;

    fn record(
        &mut self,
        fingerprint: &Fingerprint,
        scope: &DuplicateScope,
        rule_id: RuleId,
    ) -> Result<(), StoreError>;
}

// ================================================================================================
// CANONICAL FORM
// ================================================================================================

fn sorted_joined<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut items: Vec<String> = items.into_iter().map(Into::into).collect();
    items.sort();
    items.dedup();
    items.join(LIST_SEPARATOR)
}

/// Addresses plus the members of every referenced group. A group that could
/// not be resolved contributes its name so the form stays deterministic.
fn expand_addresses(
    addresses: &[String],
    group_names: &[String],
    groups: &ResolvedAddressGroups,
) -> String {
    let mut all: Vec<String> = addresses.to_vec();
    for name in group_names {
        match groups.members(name) {
            Some(members) => all.extend(members.iter().cloned()),
            None => all.push(format!("group:{}", name)),
        }
    }
    sorted_joined(all)
}

/// The string that gets hashed for one entry.
pub fn canonical_form(entry: &RuleEntry, groups: &ResolvedAddressGroups) -> String {
    let header = entry.header();
    let sources = expand_addresses(&header.source_ip_addresses, &header.source_ip_groups, groups);

    let components: Vec<String> = match entry {
        RuleEntry::Application(rule) => vec![
            GroupType::Application.tag().to_string(),
            rule.protocols
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR),
            sources,
            sorted_joined(
                rule.destination_fqdns
                    .iter()
                    .chain(rule.destination_addresses.iter())
                    .cloned(),
            ),
        ],
        RuleEntry::Network(rule) => vec![
            GroupType::Network.tag().to_string(),
            sorted_joined(rule.protocols.iter().map(|p| p.as_str())),
            sources,
            expand_addresses(
                &rule.destination_ip_addresses,
                &rule.destination_ip_groups,
                groups,
            ),
            sorted_joined(rule.destination_ports.iter().map(ToString::to_string)),
            sorted_joined(rule.destination_fqdns.iter().cloned()),
        ],
        RuleEntry::Nat(rule) => vec![
            GroupType::Nat.tag().to_string(),
            sorted_joined(rule.protocols.iter().map(|p| p.as_str())),
            sources,
            rule.destination_address.to_ascii_lowercase(),
            sorted_joined(rule.destination_ports.iter().map(ToString::to_string)),
            rule.translated_address.to_ascii_lowercase(),
            rule.translated_port.to_string(),
        ],
    };

    components.join(COMPONENT_SEPARATOR)
}

/// Computes the fingerprint of one entry.
pub fn compute_fingerprint(entry: &RuleEntry, groups: &ResolvedAddressGroups) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(canonical_form(entry, groups).as_bytes());
    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// Digest over every fingerprint of a submission, independent of entry order.
/// `None` when the submission has no entries.
pub fn compute_request_hash(fingerprints: &[Fingerprint]) -> Option<String> {
    if fingerprints.is_empty() {
        return None;
    }
    let mut sorted: Vec<&str> = fingerprints.iter().map(Fingerprint::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(sorted.join(COMPONENT_SEPARATOR).as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

// ================================================================================================
// DUPLICATE DETECTOR
// ================================================================================================

/// An entry that passed duplicate detection and received its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedRule {
    pub group_type: GroupType,
    pub rule_index: usize,
    pub rule_name: String,
    pub rule_id: RuleId,
    pub fingerprint: Fingerprint,
}

/// Checks each rule group of one submission against the index and against
/// the entries accepted earlier in the same submission.
pub struct DuplicateDetector<'a> {
    source_application: Option<&'a SourceApplicationId>,
    groups: &'a ResolvedAddressGroups,
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(
        source_application: Option<&'a SourceApplicationId>,
        groups: &'a ResolvedAddressGroups,
    ) -> Self {
        Self {
            source_application,
            groups,
        }
    }

    pub fn scope(&self, group_type: GroupType) -> DuplicateScope {
        DuplicateScope::new(self.source_application.cloned(), group_type)
    }

    /// Assigns a rule id to every entry, or reports every conflicting entry.
    pub fn check<'g, I, G>(&self, index: &I, rule_groups: G) -> Result<Vec<AcceptedRule>, AssemblyError>
    where
        I: DuplicateIndex + ?Sized,
        G: IntoIterator<Item = &'g RuleGroup>,
    {
        let mut accepted = Vec::new();
        let mut conflicts = DuplicateRuleError::default();
        // First entry of this submission holding each fingerprint
        let mut local: HashMap<(GroupType, Fingerprint), (usize, String)> = HashMap::new();

        for group in rule_groups {
            let scope = self.scope(group.group_type);
            for (i, entry) in group.rules.iter().enumerate() {
                let fingerprint = compute_fingerprint(entry, self.groups);
                debug!(
                    "{}.rules[{}] '{}' fingerprint {}",
                    group.group_type.document_key(),
                    i,
                    entry.name(),
                    fingerprint
                );

                let target = match local.get(&(group.group_type, fingerprint.clone())) {
                    Some((rule_index, rule_name)) => Some(ConflictTarget::InSubmission {
                        group_type: group.group_type,
                        rule_index: *rule_index,
                        rule_name: rule_name.clone(),
                    }),
                    None => index
                        .find(&fingerprint, &scope)?
                        .map(ConflictTarget::Stored),
                };

                if let Some(target) = target {
                    conflicts.push(DuplicateConflict {
                        group_type: group.group_type,
                        rule_index: i,
                        rule_name: entry.name().to_string(),
                        target,
                    });
                    continue;
                }

                let rule_id = RuleId::new();
                local.insert(
                    (group.group_type, fingerprint.clone()),
                    (i, entry.name().to_string()),
                );
                accepted.push(AcceptedRule {
                    group_type: group.group_type,
                    rule_index: i,
                    rule_name: entry.name().to_string(),
                    rule_id,
                    fingerprint,
                });
            }
        }

        if conflicts.is_empty() {
            Ok(accepted)
        } else {
            Err(AssemblyError::Duplicate(conflicts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, AddressGroups, SubmissionInput};
    use crate::rule_entry::{NetworkProtocol, NetworkRule, PortSpec, RuleHeader};
    use crate::rule_metadata::RuleAction;
    use proptest::prelude::*;
    use serde_json::json;

    #[derive(Default)]
    struct MapIndex(HashMap<(DuplicateScope, Fingerprint), RuleId>);

    impl DuplicateIndex for MapIndex {
        fn find(
            &self,
            fingerprint: &Fingerprint,
            scope: &DuplicateScope,
        ) -> Result<Option<RuleId>, StoreError> {
            Ok(self.0.get(&(scope.clone(), fingerprint.clone())).copied())
        }

        fn record(
            &mut self,
            fingerprint: &Fingerprint,
            scope: &DuplicateScope,
            rule_id: RuleId,
        ) -> Result<(), StoreError> {
            self.0.insert((scope.clone(), fingerprint.clone()), rule_id);
            Ok(())
        }
    }

    fn network_rule(name: &str, addresses: &[&str], groups: &[&str], ports: &[PortSpec]) -> RuleEntry {
        RuleEntry::Network(NetworkRule {
            header: RuleHeader {
                name: name.to_string(),
                ..RuleHeader::default()
            },
            protocols: vec![NetworkProtocol::Tcp, NetworkProtocol::Udp],
            destination_ip_addresses: addresses.iter().map(|s| s.to_string()).collect(),
            destination_ip_groups: groups.iter().map(|s| s.to_string()).collect(),
            destination_fqdns: vec![],
            destination_ports: ports.to_vec(),
        })
    }

    fn refs(v: &[String]) -> Vec<&str> {
        v.iter().map(String::as_str).collect()
    }

    fn groups_with(name: &str, members: &[&str]) -> ResolvedAddressGroups {
        let mut defined = AddressGroups::new();
        defined.insert(name.to_string(), members.iter().map(|s| s.to_string()).collect());
        ResolvedAddressGroups::from_submission(&defined)
    }

    #[test]
    fn name_does_not_affect_fingerprint() {
        let groups = ResolvedAddressGroups::default();
        let a = network_rule("first", &["10.0.0.1"], &[], &[PortSpec::Single(443)]);
        let b = network_rule("second", &["10.0.0.1"], &[], &[PortSpec::Single(443)]);
        assert_eq!(compute_fingerprint(&a, &groups), compute_fingerprint(&b, &groups));
    }

    #[test]
    fn group_expansion_matches_literal_address() {
        let groups = groups_with("grp1", &["10.0.0.0/24"]);
        let literal = network_rule("literal", &["10.0.0.0/24"], &[], &[PortSpec::Single(22)]);
        let grouped = network_rule("grouped", &[], &["grp1"], &[PortSpec::Single(22)]);
        assert_eq!(
            compute_fingerprint(&literal, &groups),
            compute_fingerprint(&grouped, &groups)
        );
    }

    #[test]
    fn canonical_form_layout() {
        let groups = ResolvedAddressGroups::default();
        let entry = network_rule(
            "x",
            &["10.0.0.2", "10.0.0.1"],
            &[],
            &[PortSpec::Single(443), PortSpec::Range(80, 81)],
        );
        assert_eq!(
            canonical_form(&entry, &groups),
            "NETWORK::TCP|UDP::::10.0.0.1|10.0.0.2::443|80-81::"
        );
    }

    #[test]
    fn application_pair_order_is_significant() {
        let value = |protocols: serde_json::Value| {
            json!({
                "collection_name": "web",
                "application_rules": {
                    "action": "Allow",
                    "rules": [{"name": "r", "protocols": protocols, "destination_fqdns": ["a.example.com"]}]
                }
            })
        };
        let first: SubmissionInput =
            serde_json::from_value(value(json!(["Https:443", "Http:80"]))).unwrap();
        let second: SubmissionInput =
            serde_json::from_value(value(json!(["Http:80", "Https:443"]))).unwrap();
        let groups = ResolvedAddressGroups::default();
        let fp = |input: &SubmissionInput| {
            let submission = normalize(input).unwrap();
            compute_fingerprint(&submission.application_rules.unwrap().rules[0], &groups)
        };
        assert_ne!(fp(&first), fp(&second));
    }

    #[test]
    fn detector_flags_index_and_in_submission_duplicates() {
        let groups = groups_with("grp1", &["10.0.0.0/24"]);
        let source = SourceApplicationId::new("app-1");
        let detector = DuplicateDetector::new(Some(&source), &groups);

        let stored = network_rule("stored", &["10.9.9.9"], &[], &[PortSpec::Single(22)]);
        let mut index = MapIndex::default();
        let existing = RuleId::new();
        index
            .record(
                &compute_fingerprint(&stored, &groups),
                &detector.scope(GroupType::Network),
                existing,
            )
            .unwrap();

        let group = RuleGroup {
            group_type: GroupType::Network,
            action: RuleAction::Allow,
            priority: None,
            rules: vec![
                network_rule("a", &["10.0.0.0/24"], &[], &[PortSpec::Single(22)]),
                network_rule("b", &[], &["grp1"], &[PortSpec::Single(22)]),
                network_rule("c", &["10.9.9.9"], &[], &[PortSpec::Single(22)]),
            ],
        };

        let err = detector.check(&index, [&group]).unwrap_err();
        let conflicts = match err {
            AssemblyError::Duplicate(dup) => dup.conflicts,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].rule_index, 1);
        assert_eq!(conflicts[0].rule_name, "b");
        assert_eq!(conflicts[1].rule_index, 2);
        assert_eq!(conflicts[1].target, ConflictTarget::Stored(existing));
    }

    #[test]
    fn other_scope_is_not_a_duplicate() {
        let groups = ResolvedAddressGroups::default();
        let entry = network_rule("a", &["10.0.0.1"], &[], &[PortSpec::Any]);
        let mut index = MapIndex::default();
        let other = SourceApplicationId::new("app-2");
        index
            .record(
                &compute_fingerprint(&entry, &groups),
                &DuplicateScope::new(Some(other), GroupType::Network),
                RuleId::new(),
            )
            .unwrap();

        let source = SourceApplicationId::new("app-1");
        let group = RuleGroup {
            group_type: GroupType::Network,
            action: RuleAction::Deny,
            priority: None,
            rules: vec![entry],
        };
        let accepted = DuplicateDetector::new(Some(&source), &groups)
            .check(&index, [&group])
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].rule_name, "a");
    }

    #[test]
    fn request_hash_is_order_independent() {
        let a = Fingerprint::from_hex("aa");
        let b = Fingerprint::from_hex("bb");
        assert_eq!(
            compute_request_hash(&[a.clone(), b.clone()]),
            compute_request_hash(&[b, a])
        );
        assert_eq!(compute_request_hash(&[]), None);
    }

    proptest! {
        #[test]
        fn destination_order_does_not_matter(
            octets in proptest::collection::vec(1u8..=254, 1..8),
            seed in any::<u64>()
        ) {
            let addresses: Vec<String> = octets.iter().map(|o| format!("10.0.0.{}", o)).collect();
            let mut shuffled = addresses.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            let groups = ResolvedAddressGroups::default();
            let a = network_rule("a", &refs(&addresses), &[], &[PortSpec::Single(80), PortSpec::Single(443)]);
            let b = network_rule("b", &refs(&shuffled), &[], &[PortSpec::Single(443), PortSpec::Single(80)]);
            prop_assert_eq!(compute_fingerprint(&a, &groups), compute_fingerprint(&b, &groups));
        }
    }
}

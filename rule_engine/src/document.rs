// Collection document assembly and its inverse mapping
//
// The document shape is consumed by infrastructure-as-code tooling and is
// kept stable:
//
//   { "<collection_name>": {
//       "application_name": "...",            (omitted when absent)
//       "ip_groups": { "<group>": ["10.0.0.0/24"] },
//       "rules": {
//         "application_rules": { "priority": 400, "action": "Allow", "rules": [...] },
//         "network_rules":     { ... },
//         "nat_rules":         { ... } } } }
//
// Groups absent from the submission are omitted entirely.

use crate::error::AssemblyError;
use crate::normalize::{normalize_rule, ResolvedAddressGroups, RuleInput, Submission};
use crate::priority::Priority;
use crate::rule_entry::RuleEntry;
use crate::rule_metadata::{CollectionName, GroupType, RuleAction};
use crate::validation::{coerce_integer, coerce_text, ValidationErrors};
use indexmap::IndexMap;
use log::error;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

/// A rule group with its final priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuleGroup {
    pub group_type: GroupType,
    pub action: RuleAction,
    pub priority: Priority,
    pub rules: Vec<RuleEntry>,
}

/// The consolidated document for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDocument {
    pub collection_name: CollectionName,
    pub application_name: Option<String>,
    pub ip_groups: IndexMap<String, Vec<String>>,
    groups: Vec<ResolvedRuleGroup>,
}

impl CollectionDocument {
    /// Builds the document from resolved groups. Groups are emitted in
    /// application, network, NAT order whatever order they arrive in.
    pub fn assemble(
        submission: &Submission,
        groups: Vec<ResolvedRuleGroup>,
        addresses: &ResolvedAddressGroups,
    ) -> Result<Self, AssemblyError> {
        let mut ordered: Vec<ResolvedRuleGroup> = Vec::with_capacity(groups.len());
        for group in groups {
            if ordered.iter().any(|g| g.group_type == group.group_type) {
                return Err(defect(format!(
                    "{} group supplied more than once",
                    group.group_type
                )));
            }
            if let Some(entry) = group
                .rules
                .iter()
                .find(|entry| entry.group_type() != group.group_type)
            {
                return Err(defect(format!(
                    "{} entry '{}' placed in {} group",
                    entry.group_type(),
                    entry.name(),
                    group.group_type
                )));
            }
            if group.rules.is_empty() {
                return Err(defect(format!("{} group has no rules", group.group_type)));
            }
            ordered.push(group);
        }
        ordered.sort_by_key(|g| g.group_type);

        Ok(Self {
            collection_name: submission.collection_name.clone(),
            application_name: submission.application_name.clone(),
            ip_groups: addresses
                .iter()
                .map(|(name, members)| (name.clone(), members.clone()))
                .collect(),
            groups: ordered,
        })
    }

    pub fn groups(&self) -> &[ResolvedRuleGroup] {
        &self.groups
    }

    pub fn group(&self, group_type: GroupType) -> Option<&ResolvedRuleGroup> {
        self.groups.iter().find(|g| g.group_type == group_type)
    }

    /// Every entry with its group type, in document order.
    pub fn rule_entries(&self) -> impl Iterator<Item = (GroupType, &RuleEntry)> {
        self.groups
            .iter()
            .flat_map(|g| g.rules.iter().map(move |entry| (g.group_type, entry)))
    }

    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rules.len()).sum()
    }

    // ============================================================================================
    // SERIALIZATION
    // ============================================================================================

    pub fn to_value(&self) -> Value {
        let mut body = Map::new();
        if let Some(application_name) = &self.application_name {
            body.insert("application_name".to_string(), json!(application_name));
        }
        body.insert("ip_groups".to_string(), json!(self.ip_groups));

        let mut rules = Map::new();
        for group in &self.groups {
            rules.insert(
                group.group_type.document_key().to_string(),
                json!({
                    "priority": group.priority.value(),
                    "action": group.action.to_string(),
                    "rules": group.rules.iter().map(entry_to_value).collect::<Vec<_>>(),
                }),
            );
        }
        body.insert("rules".to_string(), Value::Object(rules));

        let mut root = Map::new();
        root.insert(self.collection_name.to_string(), Value::Object(body));
        Value::Object(root)
    }

    /// Compact JSON.
    pub fn to_json(&self) -> Result<String, AssemblyError> {
        serde_json::to_string(&self.to_value()).map_err(|e| defect(e.to_string()))
    }

    /// JSON with four-space indentation.
    pub fn to_json_pretty(&self) -> Result<String, AssemblyError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.to_value()
            .serialize(&mut ser)
            .map_err(|e| defect(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| defect(e.to_string()))
    }

    /// SHA-256 of the compact JSON form.
    pub fn digest(&self) -> Result<String, AssemblyError> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_json()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    // ============================================================================================
    // INVERSE MAPPING
    // ============================================================================================

    pub fn from_json(json: &str) -> Result<Self, AssemblyError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| AssemblyError::Serialization(format!("invalid document JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Reconstructs a document, re-validating every entry.
    pub fn from_value(value: &Value) -> Result<Self, AssemblyError> {
        let root = value
            .as_object()
            .ok_or_else(|| malformed("document must be a JSON object"))?;
        if root.len() != 1 {
            return Err(malformed("document must have exactly one collection key"));
        }
        let (raw_name, body) = root
            .iter()
            .next()
            .ok_or_else(|| malformed("document has no collection key"))?;
        let collection_name = CollectionName::parse(raw_name).map_err(|e| malformed(&e))?;
        let body = body
            .as_object()
            .ok_or_else(|| malformed("collection body must be an object"))?;

        let application_name = match body.get("application_name") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(malformed("application_name must be a string")),
        };

        let mut ip_groups = IndexMap::new();
        if let Some(raw_groups) = body.get("ip_groups") {
            let raw_groups = raw_groups
                .as_object()
                .ok_or_else(|| malformed("ip_groups must be an object"))?;
            for (name, members) in raw_groups {
                let members: Vec<String> = serde_json::from_value(members.clone())
                    .map_err(|_| malformed(&format!("ip_groups.{} must be a list of strings", name)))?;
                ip_groups.insert(name.clone(), members);
            }
        }

        let rules = match body.get("rules") {
            None => Map::new(),
            Some(Value::Object(rules)) => rules.clone(),
            Some(_) => return Err(malformed("rules must be an object")),
        };

        let mut errors = ValidationErrors::new();
        let mut groups = Vec::with_capacity(rules.len());
        for (key, raw_group) in &rules {
            let group_type = GroupType::all()
                .into_iter()
                .find(|g| g.document_key() == key)
                .ok_or_else(|| malformed(&format!("unknown rule group '{}'", key)))?;
            if let Some(group) = group_from_value(group_type, raw_group, &mut errors) {
                groups.push(group);
            }
        }
        if !errors.is_empty() {
            return Err(malformed(&errors.to_string()));
        }
        groups.sort_by_key(|g| g.group_type);

        Ok(Self {
            collection_name,
            application_name,
            ip_groups,
            groups,
        })
    }
}

impl Serialize for CollectionDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn defect(message: String) -> AssemblyError {
    error!("collection document invariant broken: {}", message);
    AssemblyError::Serialization(message)
}

fn malformed(message: &str) -> AssemblyError {
    AssemblyError::Serialization(format!("malformed collection document: {}", message))
}

fn group_from_value(
    group_type: GroupType,
    value: &Value,
    errors: &mut ValidationErrors,
) -> Option<ResolvedRuleGroup> {
    let key = group_type.document_key();
    let before = errors.len();

    let priority = match coerce_integer(value.get("priority").unwrap_or(&Value::Null)) {
        Ok(Some(raw)) => Priority::new(raw)
            .map_err(|msg| errors.add(format!("{}.priority", key), msg))
            .ok(),
        Ok(None) => {
            errors.add(format!("{}.priority", key), "priority is required");
            None
        }
        Err(msg) => {
            errors.add(format!("{}.priority", key), msg);
            None
        }
    };

    let action = coerce_text(value.get("action").unwrap_or(&Value::Null))
        .ok()
        .flatten()
        .and_then(|text| RuleAction::parse(&text))
        .filter(|action| group_type.allowed_actions().contains(action));
    if action.is_none() {
        errors.add(format!("{}.action", key), "missing or invalid action");
    }

    let raw_rules: &[Value] = match value.get("rules") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => {
            errors.add(format!("{}.rules", key), "rule group must contain at least one rule");
            &[]
        }
        _ => {
            errors.add(format!("{}.rules", key), "rules must be a list");
            &[]
        }
    };
    let mut rules = Vec::with_capacity(raw_rules.len());
    for (i, raw) in raw_rules.iter().enumerate() {
        if let Some(entry) = entry_from_value(group_type, raw, &format!("{}.rules[{}]", key, i), errors) {
            rules.push(entry);
        }
    }

    if errors.len() > before {
        return None;
    }
    Some(ResolvedRuleGroup {
        group_type,
        action: action?,
        priority: priority?,
        rules,
    })
}

// ================================================================================================
// ENTRY SHAPES
// ================================================================================================

/// Serializes one entry into its document shape. Absent text fields are
/// written as empty strings.
pub fn entry_to_value(entry: &RuleEntry) -> Value {
    let header = entry.header();
    let mut out = Map::new();
    out.insert("name".to_string(), json!(header.name));
    out.insert(
        "ritm_number".to_string(),
        json!(header.ritm_number.clone().unwrap_or_default()),
    );
    out.insert(
        "description".to_string(),
        json!(header.description.clone().unwrap_or_default()),
    );

    match entry {
        RuleEntry::Application(rule) => {
            let protocols: Vec<Value> = rule
                .protocols
                .iter()
                .map(|p| json!({"port": p.port, "type": p.protocol_type.as_str()}))
                .collect();
            out.insert("protocols".to_string(), Value::Array(protocols));
            out.insert("source_ip_addresses".to_string(), json!(header.source_ip_addresses));
            out.insert("source_ip_groups".to_string(), json!(header.source_ip_groups));
            out.insert("destination_fqdns".to_string(), json!(rule.destination_fqdns));
            out.insert("destination_addresses".to_string(), json!(rule.destination_addresses));
        }
        RuleEntry::Network(rule) => {
            let protocols: Vec<&str> = rule.protocols.iter().map(|p| p.as_str()).collect();
            let ports: Vec<String> = rule.destination_ports.iter().map(ToString::to_string).collect();
            out.insert("protocols".to_string(), json!(protocols));
            out.insert("source_ip_addresses".to_string(), json!(header.source_ip_addresses));
            out.insert("source_ip_groups".to_string(), json!(header.source_ip_groups));
            out.insert(
                "destination_ip_addresses".to_string(),
                json!(rule.destination_ip_addresses),
            );
            out.insert("destination_ip_groups".to_string(), json!(rule.destination_ip_groups));
            out.insert("destination_ports".to_string(), json!(ports));
            out.insert("destination_fqdns".to_string(), json!(rule.destination_fqdns));
        }
        RuleEntry::Nat(rule) => {
            let protocols: Vec<&str> = rule.protocols.iter().map(|p| p.as_str()).collect();
            let ports: Vec<String> = rule.destination_ports.iter().map(ToString::to_string).collect();
            out.insert("protocols".to_string(), json!(protocols));
            out.insert("source_ip_addresses".to_string(), json!(header.source_ip_addresses));
            out.insert("source_ip_groups".to_string(), json!(header.source_ip_groups));
            out.insert("destination_address".to_string(), json!(rule.destination_address));
            out.insert("destination_ports".to_string(), json!(ports));
            out.insert("translated_address".to_string(), json!(rule.translated_address));
            out.insert("translated_port".to_string(), json!(rule.translated_port));
        }
    }
    Value::Object(out)
}

/// Parses one entry from its document shape through the normalizer.
pub fn entry_from_value(
    group_type: GroupType,
    value: &Value,
    path: &str,
    errors: &mut ValidationErrors,
) -> Option<RuleEntry> {
    match serde_json::from_value::<RuleInput>(value.clone()) {
        Ok(raw) => normalize_rule(group_type, &raw, path, None, errors),
        Err(e) => {
            errors.add(path, format!("entry is not an object: {}", e));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, SubmissionInput};
    use proptest::prelude::*;
    use serde_json::json;

    fn full_submission() -> Submission {
        let input: SubmissionInput = serde_json::from_value(json!({
            "collection_name": "orders-platform",
            "application_name": "Orders",
            "ip_groups": {"web_tier": ["10.1.0.0/24"]},
            "application_rules": {
                "action": "Allow",
                "rules": [{
                    "name": "api-out",
                    "ritm_number": "RITM0012345",
                    "protocols": [{"type": "Https", "port": 443}, {"type": "Http", "port": 80}],
                    "source_ip_groups": ["web_tier"],
                    "destination_fqdns": ["api.partner.com"]
                }]
            },
            "network_rules": {
                "action": "Deny",
                "rules": [{
                    "name": "block-smb",
                    "protocols": ["TCP"],
                    "source_ip_addresses": ["*"],
                    "destination_ip_addresses": ["10.2.0.0/16"],
                    "destination_ports": ["445", "137-139"]
                }]
            },
            "nat_rules": {
                "action": "Dnat",
                "rules": [{
                    "name": "public-web",
                    "protocols": ["TCP"],
                    "destination_address": "203.0.113.10",
                    "destination_ports": ["443"],
                    "translated_address": "10.1.0.5",
                    "translated_port": 8443
                }]
            }
        }))
        .unwrap();
        normalize(&input).unwrap()
    }

    fn resolved(submission: &Submission) -> Vec<ResolvedRuleGroup> {
        submission
            .groups()
            .map(|g| ResolvedRuleGroup {
                group_type: g.group_type,
                action: g.action,
                priority: Priority::new(g.group_type.baseline_priority() as i64).unwrap(),
                rules: g.rules.clone(),
            })
            .collect()
    }

    fn assemble(submission: &Submission) -> CollectionDocument {
        let addresses = ResolvedAddressGroups::from_submission(&submission.ip_groups);
        CollectionDocument::assemble(submission, resolved(submission), &addresses).unwrap()
    }

    #[test]
    fn document_shape() {
        let submission = full_submission();
        let value = assemble(&submission).to_value();

        let body = &value["orders-platform"];
        assert_eq!(body["application_name"], json!("Orders"));
        assert_eq!(body["ip_groups"], json!({"web_tier": ["10.1.0.0/24"]}));
        assert_eq!(body["rules"]["application_rules"]["priority"], json!(400));
        assert_eq!(body["rules"]["network_rules"]["action"], json!("Deny"));
        assert_eq!(body["rules"]["nat_rules"]["action"], json!("Dnat"));

        let app = &body["rules"]["application_rules"]["rules"][0];
        assert_eq!(
            app["protocols"],
            json!([{"port": 443, "type": "Https"}, {"port": 80, "type": "Http"}])
        );
        assert_eq!(app["ritm_number"], json!("RITM0012345"));
        assert_eq!(app["description"], json!(""));

        let net = &body["rules"]["network_rules"]["rules"][0];
        assert_eq!(net["protocols"], json!(["TCP"]));
        assert_eq!(net["destination_ports"], json!(["445", "137-139"]));

        let nat = &body["rules"]["nat_rules"]["rules"][0];
        assert_eq!(nat["translated_port"], json!(8443));
    }

    #[test]
    fn absent_groups_and_application_name_are_omitted() {
        let mut submission = full_submission();
        submission.application_rules = None;
        submission.nat_rules = None;
        submission.application_name = None;
        let value = assemble(&submission).to_value();
        let body = value["orders-platform"].as_object().unwrap();
        assert!(!body.contains_key("application_name"));
        let rules = body["rules"].as_object().unwrap();
        assert_eq!(rules.keys().collect::<Vec<_>>(), vec!["network_rules"]);
    }

    #[test]
    fn round_trip_reconstructs_entries() {
        let submission = full_submission();
        let document = assemble(&submission);
        let reparsed = CollectionDocument::from_json(&document.to_json_pretty().unwrap()).unwrap();

        assert_eq!(reparsed, document);
        let original: Vec<&RuleEntry> = submission.groups().flat_map(|g| g.rules.iter()).collect();
        let restored: Vec<&RuleEntry> = reparsed.rule_entries().map(|(_, e)| e).collect();
        assert_eq!(original, restored);
    }

    #[test]
    fn pretty_output_uses_four_spaces() {
        let text = assemble(&full_submission()).to_json_pretty().unwrap();
        assert!(text.starts_with("{\n    \"orders-platform\": {\n        "));
    }

    #[test]
    fn digest_is_stable() {
        let document = assemble(&full_submission());
        assert_eq!(document.digest().unwrap(), document.clone().digest().unwrap());
        assert_eq!(document.digest().unwrap().len(), 64);
    }

    #[test]
    fn mismatched_entry_is_a_defect() {
        let submission = full_submission();
        let mut groups = resolved(&submission);
        let nat_entry = groups[2].rules[0].clone();
        groups[1].rules.push(nat_entry);
        let addresses = ResolvedAddressGroups::default();
        let err = CollectionDocument::assemble(&submission, groups, &addresses).unwrap_err();
        assert!(matches!(err, AssemblyError::Serialization(_)));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        for bad in [
            json!([]),
            json!({"a": {}, "b": {}}),
            json!({"Bad Name": {"rules": {}}}),
            json!({"ok": {"rules": {"firewall_rules": {}}}}),
            json!({"ok": {"rules": {"network_rules": {"priority": 6550, "action": "Allow", "rules": []}}}}),
            json!({"ok": {"rules": {"nat_rules": {"priority": 100, "action": "Allow", "rules": []}}}}),
            json!({"ok": {"rules": {"nat_rules": {"priority": 100, "action": "Dnat", "rules": []}}}}),
            json!({"ok": {"rules": {"network_rules": {"priority": 6500, "action": "Allow"}}}}),
        ] {
            let err = CollectionDocument::from_value(&bad).unwrap_err();
            assert!(matches!(err, AssemblyError::Serialization(_)), "{}", bad);
        }
    }

    fn address() -> impl Strategy<Value = String> {
        (any::<u8>(), any::<u8>(), any::<u8>(), proptest::option::of(8u8..=32)).prop_map(
            |(a, b, c, prefix)| match prefix {
                Some(prefix) => format!("10.{}.{}.{}/{}", a, b, c, prefix),
                None => format!("10.{}.{}.{}", a, b, c),
            },
        )
    }

    fn port() -> impl Strategy<Value = String> {
        prop_oneof![
            (1u16..=65535).prop_map(|p| p.to_string()),
            (1u16..=65000, 0u16..=535).prop_map(|(start, span)| format!("{}-{}", start, start + span)),
            Just("*".to_string()),
        ]
    }

    fn network_rule_input() -> impl Strategy<Value = Value> {
        (
            proptest::sample::subsequence(vec!["TCP", "UDP", "ICMP", "Any"], 1..=4),
            proptest::collection::vec(address(), 0..3),
            proptest::collection::vec(address(), 1..4),
            proptest::collection::vec(port(), 1..4),
            proptest::option::of("RITM[0-9]{1,7}"),
        )
            .prop_map(|(protocols, sources, destinations, ports, ritm)| {
                json!({
                    "protocols": protocols,
                    "ritm_number": ritm,
                    "source_ip_addresses": sources,
                    "destination_ip_addresses": destinations,
                    "destination_ports": ports
                })
            })
    }

    fn nat_rule_input() -> impl Strategy<Value = Value> {
        (
            proptest::sample::subsequence(vec!["TCP", "UDP", "Any"], 1..=3),
            address(),
            proptest::collection::vec(port(), 1..3),
            (any::<u8>(), any::<u8>()),
            1u16..=65535,
        )
            .prop_map(|(protocols, destination, ports, (c, d), translated_port)| {
                json!({
                    "protocols": protocols,
                    "destination_address": destination,
                    "destination_ports": ports,
                    "translated_address": format!("192.168.{}.{}", c, d),
                    "translated_port": translated_port
                })
            })
    }

    fn named(rules: Vec<Value>, prefix: &str) -> Vec<Value> {
        rules
            .into_iter()
            .enumerate()
            .map(|(i, mut rule)| {
                rule["name"] = json!(format!("{}-{}", prefix, i));
                rule
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn generated_documents_round_trip(
            network in proptest::collection::vec(network_rule_input(), 1..5),
            nat in proptest::collection::vec(nat_rule_input(), 0..4)
        ) {
            let mut value = json!({
                "collection_name": "generated",
                "network_rules": {"action": "Allow", "rules": named(network, "net")}
            });
            if !nat.is_empty() {
                value["nat_rules"] = json!({"action": "Dnat", "rules": named(nat, "nat")});
            }
            let input: SubmissionInput = serde_json::from_value(value).unwrap();
            let submission = normalize(&input).unwrap();
            let document = assemble(&submission);

            let reparsed = CollectionDocument::from_json(&document.to_json().unwrap()).unwrap();
            prop_assert_eq!(&reparsed, &document);

            let expected: Vec<&RuleEntry> = submission.groups().flat_map(|g| g.rules.iter()).collect();
            let restored: Vec<&RuleEntry> = reparsed.rule_entries().map(|(_, e)| e).collect();
            prop_assert_eq!(expected, restored);
        }
    }
}

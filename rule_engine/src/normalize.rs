// Submission normalizer
//
// Turns a loosely typed submission payload into validated, normalized rule
// groups. Every violation across every group, rule and field is collected
// before returning. Address-group references are resolved in a second,
// store-aware pass.

use crate::error::{AssemblyError, StoreError};
use crate::priority::Priority;
use crate::rule_entry::{
    ApplicationProtocol, ApplicationProtocolType, ApplicationRule, NatProtocol, NatRule,
    NetworkProtocol, NetworkRule, PortSpec, RuleEntry, RuleHeader,
};
use crate::rule_metadata::{CollectionName, GroupType, RuleAction, SourceApplicationId};
use crate::validation::{
    check_address, check_fqdn, check_ip, check_ip_or_cidr, check_optional_text, check_port,
    check_rule_name, coerce_integer, coerce_list, coerce_text, dedupe_preserving_order,
    ValidationErrors, MAX_DESCRIPTION_LENGTH, MAX_RITM_LENGTH,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ================================================================================================
// RAW INPUT
// ================================================================================================

/// Submission payload as received. Every field is loosely typed so that
/// type mismatches surface as violations instead of parse failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionInput {
    pub collection_name: Value,
    pub source_application: Value,
    pub application_name: Value,
    pub requested_by: Value,
    pub ip_groups: Value,
    pub application_rules: Option<RuleGroupInput>,
    pub network_rules: Option<RuleGroupInput>,
    pub nat_rules: Option<RuleGroupInput>,
}

impl SubmissionInput {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn group(&self, group_type: GroupType) -> Option<&RuleGroupInput> {
        match group_type {
            GroupType::Application => self.application_rules.as_ref(),
            GroupType::Network => self.network_rules.as_ref(),
            GroupType::Nat => self.nat_rules.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleGroupInput {
    pub action: Value,
    pub priority: Value,
    pub rules: Vec<RuleInput>,
}

/// One raw rule. The owning group decides which fields are read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleInput {
    pub name: Value,
    pub ritm_number: Value,
    pub description: Value,
    pub protocols: Value,
    pub source_ip_addresses: Value,
    pub source_ip_groups: Value,
    pub destination_fqdns: Value,
    pub destination_addresses: Value,
    pub destination_ip_addresses: Value,
    pub destination_ip_groups: Value,
    pub destination_ports: Value,
    pub destination_address: Value,
    pub translated_address: Value,
    pub translated_port: Value,
}

// ================================================================================================
// NORMALIZED SUBMISSION
// ================================================================================================

/// Named address groups defined by one submission, in definition order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressGroups(IndexMap<String, Vec<String>>);

impl AddressGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, members: Vec<String>) {
        self.0.insert(name, members);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A validated rule group before priority resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleGroup {
    pub group_type: GroupType,
    pub action: RuleAction,
    pub priority: Option<Priority>,
    pub rules: Vec<RuleEntry>,
}

/// A fully normalized submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub collection_name: CollectionName,
    pub source_application: Option<SourceApplicationId>,
    pub application_name: Option<String>,
    pub requested_by: Option<String>,
    pub ip_groups: AddressGroups,
    pub application_rules: Option<RuleGroup>,
    pub network_rules: Option<RuleGroup>,
    pub nat_rules: Option<RuleGroup>,
}

impl Submission {
    /// Populated groups in document order.
    pub fn groups(&self) -> impl Iterator<Item = &RuleGroup> {
        [&self.application_rules, &self.network_rules, &self.nat_rules]
            .into_iter()
            .flatten()
    }

    pub fn rule_count(&self) -> usize {
        self.groups().map(|g| g.rules.len()).sum()
    }
}

// ================================================================================================
// NORMALIZER
// ================================================================================================

/// Validates and normalizes a raw submission. Pure.
pub fn normalize(input: &SubmissionInput) -> Result<Submission, ValidationErrors> {
    let mut errors = ValidationErrors::new();

    let collection_name = match coerce_text(&input.collection_name) {
        Ok(Some(raw)) => match CollectionName::parse(&raw) {
            Ok(name) => Some(name),
            Err(msg) => {
                errors.add("collection_name", msg);
                None
            }
        },
        Ok(None) => {
            errors.add("collection_name", "collection name is required");
            None
        }
        Err(msg) => {
            errors.add("collection_name", msg);
            None
        }
    };

    let source_application = match coerce_text(&input.source_application) {
        Ok(raw) => raw
            .map(SourceApplicationId::new)
            .filter(|id| !id.as_str().is_empty()),
        Err(msg) => {
            errors.add("source_application", msg);
            None
        }
    };

    let application_name = optional_text(&input.application_name, "application_name", 255, &mut errors);
    let requested_by = optional_text(&input.requested_by, "requested_by", 255, &mut errors);
    let ip_groups = normalize_address_groups(&input.ip_groups, &mut errors);

    let mut groups = GroupType::all().map(|group_type| {
        input
            .group(group_type)
            .map(|raw| normalize_group(group_type, raw, &mut errors))
    });

    if groups.iter().all(Option::is_none) {
        errors.add(
            "rules",
            "at least one of application_rules, network_rules or nat_rules is required",
        );
    }

    let [application_rules, network_rules, nat_rules] = &mut groups;
    match (
        collection_name,
        take_group(application_rules),
        take_group(network_rules),
        take_group(nat_rules),
    ) {
        (Some(collection_name), Some(application_rules), Some(network_rules), Some(nat_rules))
            if errors.is_empty() =>
        {
            Ok(Submission {
                collection_name,
                source_application,
                application_name,
                requested_by,
                ip_groups,
                application_rules,
                network_rules,
                nat_rules,
            })
        }
        _ => Err(errors),
    }
}

/// `Some(None)` for an absent group, `None` for a group that failed validation.
fn take_group(slot: &mut Option<Option<RuleGroup>>) -> Option<Option<RuleGroup>> {
    match slot.take() {
        None => Some(None),
        Some(Some(group)) => Some(Some(group)),
        Some(None) => None,
    }
}

fn optional_text(
    value: &Value,
    field: &str,
    max_len: usize,
    errors: &mut ValidationErrors,
) -> Option<String> {
    match coerce_text(value) {
        Ok(Some(raw)) => match check_optional_text(&raw, max_len) {
            Ok(text) => text,
            Err(msg) => {
                errors.add(field, msg);
                None
            }
        },
        Ok(None) => None,
        Err(msg) => {
            errors.add(field, msg);
            None
        }
    }
}

fn normalize_address_groups(value: &Value, errors: &mut ValidationErrors) -> AddressGroups {
    let mut groups = AddressGroups::new();
    let map = match value {
        Value::Null => return groups,
        Value::Object(map) => map,
        _ => {
            errors.add("ip_groups", "expected an object mapping group names to addresses");
            return groups;
        }
    };

    for (raw_name, raw_members) in map {
        let name = match check_rule_name(raw_name) {
            Ok(name) => name,
            Err(msg) => {
                errors.add(format!("ip_groups.{}", raw_name), msg);
                continue;
            }
        };
        let path = format!("ip_groups.{}", name);
        let tokens = match coerce_list(raw_members) {
            Ok(tokens) => tokens,
            Err(msg) => {
                errors.add(path, msg);
                continue;
            }
        };
        if tokens.is_empty() {
            errors.add(path, "address group must contain at least one address");
            continue;
        }
        let mut members = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            match check_ip_or_cidr(token) {
                Ok(addr) => members.push(addr),
                Err(msg) => errors.add(format!("{}[{}]", path, i), msg),
            }
        }
        if groups.contains(&name) {
            errors.add(path, "address group is defined more than once");
            continue;
        }
        groups.insert(name, dedupe_preserving_order(members));
    }
    groups
}

fn normalize_group(
    group_type: GroupType,
    raw: &RuleGroupInput,
    errors: &mut ValidationErrors,
) -> Option<RuleGroup> {
    let key = group_type.document_key();
    let before = errors.len();

    let action = match coerce_text(&raw.action) {
        Ok(Some(text)) => match RuleAction::parse(&text) {
            Some(action) if group_type.allowed_actions().contains(&action) => Some(action),
            _ => {
                let allowed: Vec<String> = group_type
                    .allowed_actions()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                errors.add_in_group(
                    group_type,
                    None,
                    format!("{}.action", key),
                    format!("'{}' is not one of {}", text.trim(), allowed.join(", ")),
                );
                None
            }
        },
        Ok(None) => {
            errors.add_in_group(group_type, None, format!("{}.action", key), "action is required");
            None
        }
        Err(msg) => {
            errors.add_in_group(group_type, None, format!("{}.action", key), msg);
            None
        }
    };

    let priority = match coerce_integer(&raw.priority) {
        Ok(None) => None,
        Ok(Some(value)) => match Priority::new(value) {
            Ok(p) => Some(p),
            Err(msg) => {
                errors.add_in_group(group_type, None, format!("{}.priority", key), msg);
                None
            }
        },
        Err(msg) => {
            errors.add_in_group(group_type, None, format!("{}.priority", key), msg);
            None
        }
    };

    if raw.rules.is_empty() {
        errors.add_in_group(
            group_type,
            None,
            format!("{}.rules", key),
            "rule group must contain at least one rule",
        );
    }

    let rules: Vec<Option<RuleEntry>> = raw
        .rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let path = format!("{}.rules[{}]", key, i);
            normalize_rule(group_type, rule, &path, Some(i), errors)
        })
        .collect();

    let mut seen_names: Vec<&str> = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        if let Some(rule) = rule {
            if seen_names.contains(&rule.name()) {
                errors.add_in_group(
                    group_type,
                    Some(i),
                    format!("{}.rules[{}].name", key, i),
                    format!("rule name '{}' is used more than once in this group", rule.name()),
                );
            }
            seen_names.push(rule.name());
        }
    }

    if errors.len() > before {
        return None;
    }
    let rules: Option<Vec<RuleEntry>> = rules.into_iter().collect();
    Some(RuleGroup {
        group_type,
        action: action?,
        priority,
        rules: rules?,
    })
}

// ================================================================================================
// RULE ENTRIES
// ================================================================================================

/// Collects violations for one rule, tagged with its group and index.
struct RuleScope<'a> {
    group_type: GroupType,
    index: Option<usize>,
    path: &'a str,
    errors: &'a mut ValidationErrors,
}

impl RuleScope<'_> {
    fn fail(&mut self, field: &str, message: impl Into<String>) {
        self.errors.add_in_group(
            self.group_type,
            self.index,
            format!("{}.{}", self.path, field),
            message,
        );
    }

    fn list(&mut self, field: &str, value: &Value) -> Vec<String> {
        match coerce_list(value) {
            Ok(tokens) => tokens,
            Err(msg) => {
                self.fail(field, msg);
                Vec::new()
            }
        }
    }

    /// Parses every token of a list field, recording a violation per bad token.
    fn each<T: PartialEq>(
        &mut self,
        field: &str,
        value: &Value,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Vec<T> {
        let tokens = self.list(field, value);
        let mut out = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            match parse(token) {
                Ok(item) => out.push(item),
                Err(msg) => self.fail(&format!("{}[{}]", field, i), msg),
            }
        }
        dedupe_preserving_order(out)
    }

    /// Like [`each`](Self::each), also failing when the raw list is empty.
    /// Lists whose tokens are all invalid only report those tokens.
    fn each_required<T: PartialEq>(
        &mut self,
        field: &str,
        value: &Value,
        message: &str,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Vec<T> {
        if matches!(coerce_list(value), Ok(ref tokens) if tokens.is_empty()) {
            self.fail(field, message);
            return Vec::new();
        }
        self.each(field, value, parse)
    }

    fn required_text(&mut self, field: &str, value: &Value) -> Option<String> {
        match coerce_text(value) {
            Ok(Some(text)) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                self.fail(field, format!("{} is required", field));
                None
            }
            Err(msg) => {
                self.fail(field, msg);
                None
            }
        }
    }

    fn optional(&mut self, field: &str, value: &Value, max_len: usize) -> Option<String> {
        match coerce_text(value).and_then(|raw| match raw {
            Some(raw) => check_optional_text(&raw, max_len),
            None => Ok(None),
        }) {
            Ok(text) => text,
            Err(msg) => {
                self.fail(field, msg);
                None
            }
        }
    }
}

/// Normalizes one rule of the given group type. Returns `None` when any
/// violation was recorded for it.
pub fn normalize_rule(
    group_type: GroupType,
    raw: &RuleInput,
    path: &str,
    index: Option<usize>,
    errors: &mut ValidationErrors,
) -> Option<RuleEntry> {
    let before = errors.len();
    let mut scope = RuleScope {
        group_type,
        index,
        path,
        errors,
    };

    let name = scope
        .required_text("name", &raw.name)
        .and_then(|text| match check_rule_name(&text) {
            Ok(name) => Some(name),
            Err(msg) => {
                scope.fail("name", msg);
                None
            }
        });

    let header = RuleHeader {
        name: name.unwrap_or_default(),
        ritm_number: scope.optional("ritm_number", &raw.ritm_number, MAX_RITM_LENGTH),
        description: scope.optional("description", &raw.description, MAX_DESCRIPTION_LENGTH),
        source_ip_addresses: scope.each("source_ip_addresses", &raw.source_ip_addresses, check_address),
        source_ip_groups: scope.each("source_ip_groups", &raw.source_ip_groups, check_rule_name),
    };

    let entry = match group_type {
        GroupType::Application => normalize_application(&mut scope, raw, header),
        GroupType::Network => normalize_network(&mut scope, raw, header),
        GroupType::Nat => normalize_nat(&mut scope, raw, header),
    };

    if scope.errors.len() > before {
        None
    } else {
        entry
    }
}

fn normalize_application(
    scope: &mut RuleScope<'_>,
    raw: &RuleInput,
    header: RuleHeader,
) -> Option<RuleEntry> {
    let protocols = application_protocols(scope, &raw.protocols);
    if protocols.is_empty() {
        scope.fail("protocols", "at least one protocol:port pair is required");
    }

    let destination_fqdns = scope.each("destination_fqdns", &raw.destination_fqdns, check_fqdn);
    let destination_addresses =
        scope.each("destination_addresses", &raw.destination_addresses, check_address);
    if destination_fqdns.is_empty() && destination_addresses.is_empty() {
        scope.fail(
            "destination_fqdns",
            "at least one destination FQDN or destination address is required",
        );
    }

    Some(RuleEntry::Application(ApplicationRule {
        header,
        protocols,
        destination_fqdns,
        destination_addresses,
    }))
}

/// Accepts `[{"type": "Https", "port": 443}]` objects (`protocol_type` also
/// accepted as the key) or `"Https:443"` strings.
fn application_protocols(scope: &mut RuleScope<'_>, value: &Value) -> Vec<ApplicationProtocol> {
    let items: Vec<Value> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        Value::String(_) => match coerce_list(value) {
            Ok(tokens) => tokens.into_iter().map(Value::String).collect(),
            Err(msg) => {
                scope.fail("protocols", msg);
                Vec::new()
            }
        },
        _ => {
            scope.fail("protocols", "expected a list of protocol:port pairs");
            Vec::new()
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let field = format!("protocols[{}]", i);
        let (raw_type, raw_port) = match item {
            Value::Object(map) => {
                let raw_type = map.get("type").or_else(|| map.get("protocol_type"));
                (
                    raw_type.and_then(|v| coerce_text(v).ok().flatten()),
                    map.get("port").and_then(|v| coerce_text(v).ok().flatten()),
                )
            }
            Value::String(s) => match s.split_once(':') {
                Some((t, p)) => (Some(t.to_string()), Some(p.to_string())),
                None => (Some(s.clone()), None),
            },
            _ => (None, None),
        };

        let protocol_type = match raw_type.as_deref().map(ApplicationProtocolType::parse) {
            Some(Some(t)) => Some(t),
            Some(None) => {
                scope.fail(&format!("{}.type", field), "protocol must be Http, Https or Mssql");
                None
            }
            None => {
                scope.fail(&field, "expected a protocol:port pair");
                None
            }
        };
        let port = match raw_port.as_deref().map(check_port) {
            Some(Ok(port)) => Some(port),
            Some(Err(msg)) => {
                scope.fail(&format!("{}.port", field), msg);
                None
            }
            None => {
                if protocol_type.is_some() {
                    scope.fail(&format!("{}.port", field), "port is required");
                }
                None
            }
        };

        if let (Some(protocol_type), Some(port)) = (protocol_type, port) {
            out.push(ApplicationProtocol { protocol_type, port });
        }
    }
    dedupe_preserving_order(out)
}

fn normalize_network(
    scope: &mut RuleScope<'_>,
    raw: &RuleInput,
    header: RuleHeader,
) -> Option<RuleEntry> {
    let protocols = scope.each_required(
        "protocols",
        &raw.protocols,
        "at least one protocol is required",
        |t| NetworkProtocol::parse(t).ok_or_else(|| format!("'{}' must be TCP, UDP, ICMP or Any", t)),
    );

    let destination_ip_addresses =
        scope.each("destination_ip_addresses", &raw.destination_ip_addresses, check_address);
    let destination_ip_groups =
        scope.each("destination_ip_groups", &raw.destination_ip_groups, check_rule_name);
    let destination_fqdns = scope.each("destination_fqdns", &raw.destination_fqdns, check_fqdn);
    if destination_ip_addresses.is_empty()
        && destination_ip_groups.is_empty()
        && destination_fqdns.is_empty()
    {
        scope.fail(
            "destination_ip_addresses",
            "at least one destination address, address group or FQDN is required",
        );
    }

    let destination_ports = scope.each_required(
        "destination_ports",
        &raw.destination_ports,
        "at least one destination port is required",
        PortSpec::parse,
    );

    Some(RuleEntry::Network(NetworkRule {
        header,
        protocols,
        destination_ip_addresses,
        destination_ip_groups,
        destination_fqdns,
        destination_ports,
    }))
}

fn normalize_nat(scope: &mut RuleScope<'_>, raw: &RuleInput, header: RuleHeader) -> Option<RuleEntry> {
    let protocols = scope.each_required(
        "protocols",
        &raw.protocols,
        "at least one protocol is required",
        |t| NatProtocol::parse(t).ok_or_else(|| format!("'{}' must be TCP, UDP or Any", t)),
    );

    let destination_address = scope
        .required_text("destination_address", &raw.destination_address)
        .and_then(|text| match check_ip_or_cidr(&text) {
            Ok(addr) => Some(addr),
            Err(msg) => {
                scope.fail("destination_address", msg);
                None
            }
        });

    let destination_ports = scope.each_required(
        "destination_ports",
        &raw.destination_ports,
        "at least one destination port is required",
        PortSpec::parse,
    );

    let translated_address = scope
        .required_text("translated_address", &raw.translated_address)
        .and_then(|text| match check_ip(&text) {
            Ok(addr) => Some(addr),
            Err(msg) => {
                scope.fail("translated_address", msg);
                None
            }
        });

    let translated_port = scope
        .required_text("translated_port", &raw.translated_port)
        .and_then(|text| match check_port(&text) {
            Ok(port) => Some(port),
            Err(msg) => {
                scope.fail("translated_port", msg);
                None
            }
        });

    Some(RuleEntry::Nat(NatRule {
        header,
        protocols,
        destination_address: destination_address?,
        destination_ports,
        translated_address: translated_address?,
        translated_port: translated_port?,
    }))
}

// ================================================================================================
// ADDRESS GROUP RESOLUTION
// ================================================================================================

/// Looks up address groups stored by earlier submissions.
pub trait AddressGroupDirectory {
    /// Members of the most recent live definition of `name` for this source
    /// application, if any.
    fn lookup_group(
        &self,
        source: Option<&SourceApplicationId>,
        name: &str,
    ) -> Result<Option<Vec<String>>, StoreError>;
}

/// Every address group a submission can see: its own definitions first,
/// then referenced groups resolved from earlier submissions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedAddressGroups {
    groups: IndexMap<String, Vec<String>>,
    external: Vec<String>,
}

impl ResolvedAddressGroups {
    /// Groups defined by the submission itself.
    pub fn from_submission(groups: &AddressGroups) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|(name, members)| (name.clone(), members.clone()))
                .collect(),
            external: Vec::new(),
        }
    }

    pub fn members(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.groups.iter()
    }

    /// Names resolved from earlier submissions.
    pub fn external(&self) -> &[String] {
        &self.external
    }

    fn add_external(&mut self, name: String, members: Vec<String>) {
        self.external.push(name.clone());
        self.groups.insert(name, members);
    }
}

/// Resolves every address-group reference in the submission. Unknown
/// references are reported as validation violations.
pub fn resolve_address_groups<D: AddressGroupDirectory + ?Sized>(
    submission: &Submission,
    directory: &D,
) -> Result<ResolvedAddressGroups, AssemblyError> {
    let mut resolved = ResolvedAddressGroups::from_submission(&submission.ip_groups);
    let mut errors = ValidationErrors::new();
    let source = submission.source_application.as_ref();

    for group in submission.groups() {
        for (i, rule) in group.rules.iter().enumerate() {
            let references = rule
                .header()
                .source_ip_groups
                .iter()
                .enumerate()
                .map(|(j, name)| (format!("source_ip_groups[{}]", j), name));
            let destinations = match rule {
                RuleEntry::Network(network) => network
                    .destination_ip_groups
                    .iter()
                    .enumerate()
                    .map(|(j, name)| (format!("destination_ip_groups[{}]", j), name))
                    .collect(),
                _ => Vec::new(),
            };

            for (field, name) in references.chain(destinations) {
                if resolved.members(name).is_some() {
                    continue;
                }
                match directory.lookup_group(source, name)? {
                    Some(members) => resolved.add_external(name.clone(), members),
                    None => undefined_group(&mut errors, group.group_type, i, &field, name),
                }
            }
        }
    }

    errors.into_result()?;
    Ok(resolved)
}

/// Reports address-group references in a raw submission that neither the
/// submission nor the directory defines. Works on unnormalized input so
/// undefined groups can be reported alongside other violations; malformed
/// names are left to [`normalize`].
pub fn check_group_references<D: AddressGroupDirectory + ?Sized>(
    input: &SubmissionInput,
    directory: &D,
) -> Result<ValidationErrors, StoreError> {
    let mut errors = ValidationErrors::new();
    let source = coerce_text(&input.source_application)
        .ok()
        .flatten()
        .map(SourceApplicationId::new)
        .filter(|id| !id.as_str().is_empty());
    let defined: Vec<String> = match &input.ip_groups {
        Value::Object(map) => map
            .keys()
            .filter_map(|name| check_rule_name(name).ok())
            .collect(),
        _ => Vec::new(),
    };

    for group_type in GroupType::all() {
        let raw = match input.group(group_type) {
            Some(raw) => raw,
            None => continue,
        };
        for (i, rule) in raw.rules.iter().enumerate() {
            let mut fields = vec![("source_ip_groups", &rule.source_ip_groups)];
            if group_type == GroupType::Network {
                fields.push(("destination_ip_groups", &rule.destination_ip_groups));
            }
            for (field, value) in fields {
                let tokens = coerce_list(value).unwrap_or_default();
                for (j, token) in tokens.iter().enumerate() {
                    let name = match check_rule_name(token) {
                        Ok(name) => name,
                        Err(_) => continue,
                    };
                    if defined.contains(&name) {
                        continue;
                    }
                    if directory.lookup_group(source.as_ref(), &name)?.is_none() {
                        let field = format!("{}[{}]", field, j);
                        undefined_group(&mut errors, group_type, i, &field, &name);
                    }
                }
            }
        }
    }
    Ok(errors)
}

fn undefined_group(
    errors: &mut ValidationErrors,
    group_type: GroupType,
    rule_index: usize,
    field: &str,
    name: &str,
) {
    errors.add_in_group(
        group_type,
        Some(rule_index),
        format!("{}.rules[{}].{}", group_type.document_key(), rule_index, field),
        format!("address group '{}' is not defined", name),
    );
}

// Identity and classification types for firewall rule collections
//
// This module defines the identifiers that accompany every collection and
// rule entry in the system, along with the group types and actions that
// classify a rule collection.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use uuid::Uuid;

// These newtypes make the code more readable and provide type safety.
// Instead of passing String/Uuid everywhere we carry the semantic meaning.

/// Unique identifier for a persisted rule entry.
/// This is a UUID v4 assigned when the entry is accepted. Duplicate
/// detection reports conflicts by this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(Uuid);

impl RuleId {
    /// Create a new random rule UUID.
    pub fn new() -> Self {
        RuleId(Uuid::new_v4())
    }

    /// Returns the underlying rule uuid
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Converts to a string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RuleId {
    fn from(uuid: Uuid) -> Self {
        RuleId(uuid)
    }
}

impl FromStr for RuleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RuleId)
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one persisted submission (collection record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(Uuid);

impl CollectionId {
    pub fn new() -> Self {
        CollectionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CollectionId {
    fn from(uuid: Uuid) -> Self {
        CollectionId(uuid)
    }
}

impl FromStr for CollectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(CollectionId)
    }
}

impl std::fmt::Display for CollectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the application a submission belongs to.
///
/// The source application establishes the scope for priority assignment
/// and duplicate detection. It is an opaque value (numeric id, app code or
/// slug); only its trimmed string form is compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceApplicationId(String);

impl SourceApplicationId {
    /// Creates a new SourceApplicationId, trimming surrounding whitespace.
    pub fn new(id: impl Into<String>) -> Self {
        SourceApplicationId(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SourceApplicationId {
    fn from(s: String) -> Self {
        SourceApplicationId::new(s)
    }
}

impl From<&str> for SourceApplicationId {
    fn from(s: &str) -> Self {
        SourceApplicationId::new(s)
    }
}

impl std::fmt::Display for SourceApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

static COLLECTION_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]{1,120}$").expect("collection name pattern compiles"));

/// Validated name of a rule collection. Becomes the top-level key of the
/// collection document.
///
/// Must match `[a-z0-9-]{1,120}` after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionName(String);

impl CollectionName {
    /// Validates and wraps a collection name.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let cleaned = raw.trim();
        if cleaned.is_empty() {
            return Err("collection name cannot be empty".to_string());
        }
        if !COLLECTION_NAME_PATTERN.is_match(cleaned) {
            return Err(format!(
                "collection name '{}' must be 1-120 characters of lowercase letters, digits or hyphens",
                cleaned
            ));
        }
        Ok(CollectionName(cleaned.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CollectionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CollectionName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CollectionName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CollectionName::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// GROUP TYPES AND ACTIONS

/// The three kinds of rule collection a submission may carry.
///
/// Each type has its own document key, storage tag and baseline priority.
/// Baselines reflect the layered evaluation order of the consuming
/// firewall policy: NAT first, then application, then network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupType {
    /// Layer-7 rules matched on protocol, port and FQDN
    Application,
    /// Layer-4 rules matched on protocol, address and port
    Network,
    /// Destination NAT rules
    Nat,
}

impl GroupType {
    /// Returns all group types in document order
    pub fn all() -> [GroupType; 3] {
        [GroupType::Application, GroupType::Network, GroupType::Nat]
    }

    /// Key used for this group inside the collection document.
    pub fn document_key(&self) -> &'static str {
        match self {
            GroupType::Application => "application_rules",
            GroupType::Network => "network_rules",
            GroupType::Nat => "nat_rules",
        }
    }

    /// Stable tag used in storage and fingerprints.
    pub fn tag(&self) -> &'static str {
        match self {
            GroupType::Application => "APPLICATION",
            GroupType::Network => "NETWORK",
            GroupType::Nat => "NAT",
        }
    }

    /// Priority assigned to the first auto-prioritized collection of this type.
    pub fn baseline_priority(&self) -> u32 {
        match self {
            GroupType::Application => 400,
            GroupType::Network => 6500,
            GroupType::Nat => 100,
        }
    }

    /// Parses a storage tag back into a group type.
    pub fn from_tag(tag: &str) -> Option<GroupType> {
        match tag {
            "APPLICATION" => Some(GroupType::Application),
            "NETWORK" => Some(GroupType::Network),
            "NAT" => Some(GroupType::Nat),
            _ => None,
        }
    }

    /// Actions a group of this type may carry.
    pub fn allowed_actions(&self) -> &'static [RuleAction] {
        match self {
            GroupType::Application | GroupType::Network => &[RuleAction::Allow, RuleAction::Deny],
            GroupType::Nat => &[RuleAction::Dnat],
        }
    }
}

impl std::fmt::Display for GroupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Action shared by every rule of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    /// Permit matching traffic
    Allow,
    /// Drop matching traffic
    Deny,
    /// Destination NAT (only valid for NAT collections)
    Dnat,
}

impl RuleAction {
    /// Parses an action case-insensitively ("allow", "ALLOW", "Allow").
    pub fn parse(raw: &str) -> Option<RuleAction> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ALLOW" => Some(RuleAction::Allow),
            "DENY" => Some(RuleAction::Deny),
            "DNAT" => Some(RuleAction::Dnat),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "Allow"),
            RuleAction::Deny => write!(f, "Deny"),
            RuleAction::Dnat => write!(f, "Dnat"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_accepts_lowercase_hyphenated() {
        let name = CollectionName::parse("my-collection-1").unwrap();
        assert_eq!(name.as_str(), "my-collection-1");
    }

    #[test]
    fn collection_name_rejects_uppercase_and_symbols() {
        assert!(CollectionName::parse("My_Collection!").is_err());
        assert!(CollectionName::parse("under_score").is_err());
        assert!(CollectionName::parse("   ").is_err());
        assert!(CollectionName::parse(&"a".repeat(121)).is_err());
        assert!(CollectionName::parse(&"a".repeat(120)).is_ok());
    }

    #[test]
    fn group_type_baselines_and_keys() {
        assert_eq!(GroupType::Application.baseline_priority(), 400);
        assert_eq!(GroupType::Network.baseline_priority(), 6500);
        assert_eq!(GroupType::Nat.baseline_priority(), 100);
        assert_eq!(GroupType::Network.document_key(), "network_rules");
        for group in GroupType::all() {
            assert_eq!(GroupType::from_tag(group.tag()), Some(group));
        }
    }

    #[test]
    fn rule_action_parses_case_insensitively() {
        assert_eq!(RuleAction::parse(" allow "), Some(RuleAction::Allow));
        assert_eq!(RuleAction::parse("DENY"), Some(RuleAction::Deny));
        assert_eq!(RuleAction::parse("Dnat"), Some(RuleAction::Dnat));
        assert_eq!(RuleAction::parse("drop"), None);
        assert_eq!(RuleAction::Dnat.to_string(), "Dnat");
    }

    #[test]
    fn nat_groups_only_allow_dnat() {
        assert_eq!(GroupType::Nat.allowed_actions(), &[RuleAction::Dnat]);
        assert!(GroupType::Network.allowed_actions().contains(&RuleAction::Deny));
    }

    #[test]
    fn source_application_is_trimmed() {
        let id = SourceApplicationId::new("  APP-42 ");
        assert_eq!(id.as_str(), "APP-42");
        assert_eq!(id, SourceApplicationId::from("APP-42"));
    }
}

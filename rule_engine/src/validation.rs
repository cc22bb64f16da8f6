// Field-level validation primitives
//
// Violations are accumulated rather than returned on first failure so a
// caller sees every problem in a submission at once. The syntax checkers
// below return the normalized form of a value on success.

use crate::rule_metadata::GroupType;
use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;

static RULE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]{1,128}$").expect("rule name pattern compiles"));

static FQDN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$")
        .expect("fqdn pattern compiles")
});

pub const MAX_RITM_LENGTH: usize = 64;
pub const MAX_DESCRIPTION_LENGTH: usize = 500;
const MAX_FQDN_LENGTH: usize = 253;

// ================================================================================================
// VIOLATIONS
// ================================================================================================

/// A single field-level problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `network_rules.rules[1].destination_ports[0]`
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_type: Option<GroupType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_index: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in one pass over a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationErrors {
    violations: Vec<Violation>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a violation that is not tied to a rule group.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation {
            field: field.into(),
            group_type: None,
            rule_index: None,
            message: message.into(),
        });
    }

    /// Records a violation inside a rule group, optionally pinned to one rule.
    pub fn add_in_group(
        &mut self,
        group_type: GroupType,
        rule_index: Option<usize>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.violations.push(Violation {
            field: field.into(),
            group_type: Some(group_type),
            rule_index,
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.violations.extend(other.violations);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// True when some violation names exactly this field path.
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }

    /// Ok when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, violation) in self.violations.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ================================================================================================
// SYNTAX CHECKERS
// ================================================================================================

/// Rule and address-group names: `[a-z0-9_-]{1,128}` after trimming.
pub fn check_rule_name(raw: &str) -> Result<String, String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if !RULE_NAME_PATTERN.is_match(cleaned) {
        return Err(format!(
            "'{}' must be 1-128 characters of lowercase letters, digits, underscores or hyphens",
            cleaned
        ));
    }
    Ok(cleaned.to_string())
}

/// A single IP address, rendered in canonical textual form.
pub fn check_ip(raw: &str) -> Result<String, String> {
    let cleaned = raw.trim();
    cleaned
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| format!("'{}' is not a valid IP address", cleaned))
}

/// An IP address or CIDR block. Plain addresses stay plain.
pub fn check_ip_or_cidr(raw: &str) -> Result<String, String> {
    let cleaned = raw.trim();
    if cleaned.contains('/') {
        cleaned
            .parse::<IpNetwork>()
            .map(|net| format!("{}/{}", net.ip(), net.prefix()))
            .map_err(|_| format!("'{}' is not a valid CIDR block", cleaned))
    } else {
        check_ip(cleaned)
    }
}

/// An IP address, CIDR block, or the `*` wildcard (`any` is accepted as a synonym).
pub fn check_address(raw: &str) -> Result<String, String> {
    let cleaned = raw.trim();
    if cleaned == "*" || cleaned.eq_ignore_ascii_case("any") {
        return Ok("*".to_string());
    }
    check_ip_or_cidr(cleaned)
}

/// Hostname with an optional leading `*.`; lowercased.
pub fn check_fqdn(raw: &str) -> Result<String, String> {
    let lowered = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if lowered.is_empty() {
        return Err("FQDN cannot be empty".to_string());
    }
    if lowered.len() > MAX_FQDN_LENGTH || !FQDN_PATTERN.is_match(&lowered) {
        return Err(format!("'{}' is not a valid FQDN", raw.trim()));
    }
    Ok(lowered)
}

/// Port in `1..=65535`.
pub fn check_port(raw: &str) -> Result<u16, String> {
    let cleaned = raw.trim();
    match cleaned.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        Ok(_) => Err(format!("port {} is outside 1-65535", cleaned)),
        Err(_) => Err(format!("'{}' is not a valid port", cleaned)),
    }
}

/// Trims an optional free-text field, treating blank as absent.
pub fn check_optional_text(raw: &str, max_len: usize) -> Result<Option<String>, String> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return Ok(None);
    }
    if cleaned.chars().count() > max_len {
        return Err(format!("must be at most {} characters", max_len));
    }
    Ok(Some(cleaned.to_string()))
}

// ================================================================================================
// LOOSE VALUE COERCION
// ================================================================================================

/// Reads a scalar as text. Numbers and booleans are rendered; null is absent.
pub fn coerce_text(value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        _ => Err("expected a string".to_string()),
    }
}

/// Reads a list of tokens. Accepts an array or a single string; every string
/// is split on commas and blank tokens are dropped.
pub fn coerce_list(value: &Value) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    match value {
        Value::Null => {}
        Value::String(s) => push_split(&mut tokens, s),
        Value::Number(n) => tokens.push(n.to_string()),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => push_split(&mut tokens, s),
                    Value::Number(n) => tokens.push(n.to_string()),
                    Value::Null => {}
                    _ => return Err("list items must be strings or numbers".to_string()),
                }
            }
        }
        _ => return Err("expected a list or a comma-separated string".to_string()),
    }
    Ok(tokens)
}

fn push_split(tokens: &mut Vec<String>, raw: &str) {
    tokens.extend(
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    );
}

/// Reads an integer given as a number or a numeric string.
pub fn coerce_integer(value: &Value) -> Result<Option<i64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{} is not an integer", n)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("'{}' is not an integer", s.trim())),
        _ => Err("expected an integer".to_string()),
    }
}

/// Drops repeated items, keeping first-occurrence order.
pub fn dedupe_preserving_order<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

// Normalized rule entries, one variant per group type

use crate::rule_metadata::GroupType;
use serde::{Deserialize, Serialize};

// ================================================================================================
// PROTOCOLS
// ================================================================================================

/// Layer-7 protocol of an application rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApplicationProtocolType {
    Http,
    Https,
    Mssql,
}

impl ApplicationProtocolType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Some(ApplicationProtocolType::Http),
            "https" => Some(ApplicationProtocolType::Https),
            "mssql" => Some(ApplicationProtocolType::Mssql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationProtocolType::Http => "Http",
            ApplicationProtocolType::Https => "Https",
            ApplicationProtocolType::Mssql => "Mssql",
        }
    }
}

/// A `(protocol, port)` pair. Order inside a rule is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplicationProtocol {
    pub protocol_type: ApplicationProtocolType,
    pub port: u16,
}

impl std::fmt::Display for ApplicationProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.protocol_type.as_str(), self.port)
    }
}

/// Layer-4 protocol of a network rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkProtocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl NetworkProtocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TCP" => Some(NetworkProtocol::Tcp),
            "UDP" => Some(NetworkProtocol::Udp),
            "ICMP" => Some(NetworkProtocol::Icmp),
            "ANY" | "*" => Some(NetworkProtocol::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProtocol::Tcp => "TCP",
            NetworkProtocol::Udp => "UDP",
            NetworkProtocol::Icmp => "ICMP",
            NetworkProtocol::Any => "Any",
        }
    }
}

/// Protocol of a NAT rule. ICMP has no port to translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NatProtocol {
    Tcp,
    Udp,
    Any,
}

impl NatProtocol {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TCP" => Some(NatProtocol::Tcp),
            "UDP" => Some(NatProtocol::Udp),
            "ANY" | "*" => Some(NatProtocol::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NatProtocol::Tcp => "TCP",
            NatProtocol::Udp => "UDP",
            NatProtocol::Any => "Any",
        }
    }
}

// ================================================================================================
// PORTS
// ================================================================================================

/// One destination-port token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Single(u16),
    /// Inclusive range, `start <= end`
    Range(u16, u16),
    Any,
}

impl PortSpec {
    /// Parses `443`, `8000-8080` or `*`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let cleaned = raw.trim();
        if cleaned == "*" || cleaned.eq_ignore_ascii_case("any") {
            return Ok(PortSpec::Any);
        }
        match cleaned.split_once('-') {
            Some((start, end)) => {
                let start = crate::validation::check_port(start)?;
                let end = crate::validation::check_port(end)?;
                if start > end {
                    return Err(format!("range {} has start greater than end", cleaned));
                }
                if start == end {
                    Ok(PortSpec::Single(start))
                } else {
                    Ok(PortSpec::Range(start, end))
                }
            }
            None => crate::validation::check_port(cleaned).map(PortSpec::Single),
        }
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortSpec::Single(port) => write!(f, "{}", port),
            PortSpec::Range(start, end) => write!(f, "{}-{}", start, end),
            PortSpec::Any => write!(f, "*"),
        }
    }
}

// ================================================================================================
// RULE ENTRIES
// ================================================================================================

/// Fields every rule carries regardless of group type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleHeader {
    pub name: String,
    pub ritm_number: Option<String>,
    pub description: Option<String>,
    pub source_ip_addresses: Vec<String>,
    /// Address-group names expanded to members for fingerprinting
    pub source_ip_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationRule {
    pub header: RuleHeader,
    pub protocols: Vec<ApplicationProtocol>,
    pub destination_fqdns: Vec<String>,
    pub destination_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRule {
    pub header: RuleHeader,
    pub protocols: Vec<NetworkProtocol>,
    pub destination_ip_addresses: Vec<String>,
    pub destination_ip_groups: Vec<String>,
    pub destination_fqdns: Vec<String>,
    pub destination_ports: Vec<PortSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub header: RuleHeader,
    pub protocols: Vec<NatProtocol>,
    pub destination_address: String,
    pub destination_ports: Vec<PortSpec>,
    pub translated_address: String,
    pub translated_port: u16,
}

/// A normalized rule. The variant always matches the owning group's type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEntry {
    Application(ApplicationRule),
    Network(NetworkRule),
    Nat(NatRule),
}

impl RuleEntry {
    pub fn group_type(&self) -> GroupType {
        match self {
            RuleEntry::Application(_) => GroupType::Application,
            RuleEntry::Network(_) => GroupType::Network,
            RuleEntry::Nat(_) => GroupType::Nat,
        }
    }

    pub fn header(&self) -> &RuleHeader {
        match self {
            RuleEntry::Application(rule) => &rule.header,
            RuleEntry::Network(rule) => &rule.header,
            RuleEntry::Nat(rule) => &rule.header,
        }
    }

    pub fn name(&self) -> &str {
        &self.header().name
    }

    /// Every address-group name this entry references.
    pub fn referenced_groups(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .header()
            .source_ip_groups
            .iter()
            .map(String::as_str)
            .collect();
        if let RuleEntry::Network(rule) = self {
            names.extend(rule.destination_ip_groups.iter().map(String::as_str));
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_spec_parsing() {
        assert_eq!(PortSpec::parse("443").unwrap(), PortSpec::Single(443));
        assert_eq!(PortSpec::parse("8000-8080").unwrap(), PortSpec::Range(8000, 8080));
        assert_eq!(PortSpec::parse("22-22").unwrap(), PortSpec::Single(22));
        assert_eq!(PortSpec::parse("*").unwrap(), PortSpec::Any);
        assert!(PortSpec::parse("9000-8000").is_err());
        assert!(PortSpec::parse("0").is_err());
        assert!(PortSpec::parse("1-70000").is_err());
        assert_eq!(PortSpec::Range(1, 1024).to_string(), "1-1024");
    }

    #[test]
    fn protocol_parsing_is_case_insensitive() {
        assert_eq!(
            ApplicationProtocolType::parse("HTTPS"),
            Some(ApplicationProtocolType::Https)
        );
        assert_eq!(NetworkProtocol::parse("any"), Some(NetworkProtocol::Any));
        assert_eq!(NetworkProtocol::Any.as_str(), "Any");
        assert_eq!(NatProtocol::parse("icmp"), None);
        assert_eq!(NatProtocol::parse("udp"), Some(NatProtocol::Udp));
    }

    #[test]
    fn referenced_groups_cover_sources_and_destinations() {
        let entry = RuleEntry::Network(NetworkRule {
            header: RuleHeader {
                name: "n1".to_string(),
                source_ip_groups: vec!["office".to_string()],
                ..RuleHeader::default()
            },
            protocols: vec![NetworkProtocol::Tcp],
            destination_ip_addresses: vec![],
            destination_ip_groups: vec!["db".to_string()],
            destination_fqdns: vec![],
            destination_ports: vec![PortSpec::Single(5432)],
        });
        assert_eq!(entry.referenced_groups(), vec!["office", "db"]);
        assert_eq!(entry.group_type(), GroupType::Network);
        assert_eq!(entry.name(), "n1");
    }
}

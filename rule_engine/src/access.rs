// Who may see which collections

use serde::{Deserialize, Serialize};

/// Administrator lists, injected as configuration.
///
/// Admins and network admins see every collection; everyone else only sees
/// the collections they requested. Email comparison is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub admin_emails: Vec<String>,
    pub network_admin_emails: Vec<String>,
}

impl AccessPolicy {
    pub fn new(admin_emails: Vec<String>, network_admin_emails: Vec<String>) -> Self {
        Self {
            admin_emails: normalize_emails(admin_emails),
            network_admin_emails: normalize_emails(network_admin_emails),
        }
    }

    /// Builds a policy from two raw settings values (see [`parse_emails`]).
    ///
    /// [`parse_emails`]: AccessPolicy::parse_emails
    pub fn from_settings(admins: Option<&str>, network_admins: Option<&str>) -> Self {
        Self::new(
            admins.map(Self::parse_emails).unwrap_or_default(),
            network_admins.map(Self::parse_emails).unwrap_or_default(),
        )
    }

    /// Accepts `a@x.com, b@x.com` or a JSON array string `["a@x.com"]`.
    pub fn parse_emails(raw: &str) -> Vec<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if trimmed.starts_with('[') {
            if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
                return normalize_emails(list);
            }
        }
        normalize_emails(trimmed.split(',').map(str::to_string).collect())
    }

    pub fn is_admin(&self, email: &str) -> bool {
        contains_email(&self.admin_emails, email)
    }

    pub fn is_network_admin(&self, email: &str) -> bool {
        contains_email(&self.network_admin_emails, email)
    }

    pub fn can_view_all(&self, email: &str) -> bool {
        self.is_admin(email) || self.is_network_admin(email)
    }

    /// Whether `viewer` may see a collection requested by `requested_by`.
    /// No viewer means an operator context with unrestricted access.
    pub fn can_view(&self, viewer: Option<&str>, requested_by: Option<&str>) -> bool {
        match viewer {
            None => true,
            Some(viewer) if self.can_view_all(viewer) => true,
            Some(viewer) => requested_by
                .map(|owner| owner.trim().eq_ignore_ascii_case(viewer.trim()))
                .unwrap_or(false),
        }
    }
}

fn normalize_emails(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for email in raw {
        let email = email.trim().to_ascii_lowercase();
        if !email.is_empty() && !out.contains(&email) {
            out.push(email);
        }
    }
    out
}

fn contains_email(list: &[String], email: &str) -> bool {
    let email = email.trim().to_ascii_lowercase();
    !email.is_empty() && list.iter().any(|e| *e == email)
}

//! Email address value object and recipient type.
//!
//! Addresses are validated and case-normalized at the boundary so the rest
//! of the engine can treat them as opaque, deduplicatable strings.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

const MAX_ADDRESS_LEN: usize = 254;
const MAX_LOCAL_LEN: usize = 64;

/// A syntactically valid, lowercased email address.
///
/// Validation is deliberately conservative: one `@`, non-empty local part,
/// a dotted domain, no whitespace. Deliverability is the transport's
/// problem, not ours.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(input: &str) -> DomainResult<Self> {
        let normalized = input.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(DomainError::validation("email address is empty"));
        }
        if normalized.len() > MAX_ADDRESS_LEN {
            return Err(DomainError::validation(format!(
                "email address exceeds {MAX_ADDRESS_LEN} characters"
            )));
        }
        if normalized.chars().any(char::is_whitespace) {
            return Err(DomainError::validation(format!(
                "email address contains whitespace: {normalized}"
            )));
        }
        let Some((local, domain)) = normalized.split_once('@') else {
            return Err(DomainError::validation(format!(
                "email address is missing '@': {normalized}"
            )));
        };
        if local.is_empty() || local.len() > MAX_LOCAL_LEN {
            return Err(DomainError::validation(format!(
                "email local part must be 1..={MAX_LOCAL_LEN} characters: {normalized}"
            )));
        }
        if domain.contains('@') {
            return Err(DomainError::validation(format!(
                "email address has multiple '@': {normalized}"
            )));
        }
        if !domain.contains('.')
            || domain.split('.').any(str::is_empty)
            || domain.starts_with('-')
            || domain.ends_with('-')
        {
            return Err(DomainError::validation(format!(
                "email domain is malformed: {normalized}"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl core::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for EmailAddress {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

/// A recipient extracted from an upload: address plus an optional display
/// name. Arrives already parsed out of whatever file the operator uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: EmailAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Recipient {
    pub fn new(email: EmailAddress) -> Self {
        Self { email, name: None }
    }

    pub fn named(email: EmailAddress, name: impl Into<String>) -> Self {
        Self {
            email,
            name: Some(name.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes_mixed_case() {
        let addr = EmailAddress::parse("  Ada.Lovelace@Example.COM ").unwrap();
        assert_eq!(addr.as_str(), "ada.lovelace@example.com");
    }

    #[test]
    fn equal_after_normalization() {
        let a = EmailAddress::parse("ops@example.com").unwrap();
        let b = EmailAddress::parse("OPS@EXAMPLE.COM").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "",
            "no-at-sign",
            "two@@example.com",
            "@example.com",
            "user@",
            "user@nodot",
            "user@bad..dots",
            "user name@example.com",
        ] {
            assert!(
                EmailAddress::parse(bad).is_err(),
                "expected rejection: {bad:?}"
            );
        }
    }

    #[test]
    fn serde_round_trip_validates() {
        let addr: EmailAddress = serde_json::from_str("\"User@Example.com\"").unwrap();
        assert_eq!(addr.as_str(), "user@example.com");
        assert!(serde_json::from_str::<EmailAddress>("\"nope\"").is_err());
    }
}

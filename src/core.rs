//! # Core Utilities
//!
//! Shared primitives used across the service.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of a party (organization or vendor) in the network registry.
///
/// Party identifiers are OID-qualified URNs, e.g.
/// `urn:oid:2.16.840.1.113883.2.4.6.1:00000007`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Parse a party identifier, validating the `urn:oid:<oid>:<value>` shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when the value is not an OID-qualified
    /// URN or the value part is empty.
    pub fn parse(s: impl Into<String>) -> Result<Self, Error> {
        let s = s.into();
        let rest = s
            .strip_prefix("urn:oid:")
            .ok_or_else(|| Error::InvalidInput(format!("invalid party identifier: {s}")))?;
        let Some((oid, value)) = rest.split_once(':') else {
            return Err(Error::InvalidInput(format!("invalid party identifier: {s}")));
        };
        if oid.is_empty()
            || value.is_empty()
            || !oid.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(Error::InvalidInput(format!("invalid party identifier: {s}")));
        }
        Ok(Self(s))
    }

    /// The OID part of the identifier.
    #[must_use]
    pub fn oid(&self) -> &str {
        self.0
            .strip_prefix("urn:oid:")
            .and_then(|rest| rest.split_once(':'))
            .map_or("", |(oid, _)| oid)
    }

    /// The value part of the identifier.
    #[must_use]
    pub fn value(&self) -> &str {
        self.0
            .strip_prefix("urn:oid:")
            .and_then(|rest| rest.split_once(':'))
            .map_or("", |(_, value)| value)
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PartyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_id_roundtrip() {
        let id = PartyId::parse("urn:oid:2.16.840.1.113883.2.4.6.1:00000007").expect("valid urn");
        assert_eq!(id.oid(), "2.16.840.1.113883.2.4.6.1");
        assert_eq!(id.value(), "00000007");
        assert_eq!(id.to_string(), "urn:oid:2.16.840.1.113883.2.4.6.1:00000007");
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(PartyId::parse("urn:uuid:1234").is_err());
        assert!(PartyId::parse("urn:oid:not-an-oid:1").is_err());
        assert!(PartyId::parse("urn:oid:1.2.3:").is_err());
        assert!(PartyId::parse("plain string").is_err());
    }
}

//! Correlation IDs.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the correlation ID in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation identifier for one logical request.
///
/// Minted values are canonical UUIDv4 text. Inherited values are kept
/// verbatim, whatever their shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh random ID.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Adopt the incoming header value when it is non-empty, otherwise mint.
    pub fn adopt_or_mint(incoming: Option<&str>) -> Self {
        match incoming {
            Some(value) if !value.trim().is_empty() => Self(value.to_string()),
            _ => Self::mint(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_is_canonical_uuid() {
        let id = RequestId::mint();
        assert_eq!(id.as_str().len(), 36);
        assert!(
            id.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-')
        );
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_adopts_incoming_verbatim() {
        let id = RequestId::adopt_or_mint(Some("abc-123"));
        assert_eq!(id.as_str(), "abc-123");
    }

    #[test]
    fn test_mints_on_empty_or_missing() {
        assert_eq!(RequestId::adopt_or_mint(Some("")).as_str().len(), 36);
        assert_eq!(RequestId::adopt_or_mint(Some("   ")).as_str().len(), 36);
        assert_eq!(RequestId::adopt_or_mint(None).as_str().len(), 36);
    }

    #[test]
    fn test_minted_ids_differ() {
        assert_ne!(RequestId::mint(), RequestId::mint());
    }
}

//! Credential identifiers and authorization records.
//!
//! A credential is an RFID tag identifier mapped to a resident, the address
//! the resident may open, and an authorization flag. The credential id is
//! the sole key of the local credential store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized RFID tag identifier.
///
/// Ids are trimmed and upper-cased on construction so that ids coming from
/// the remote store and ids scanned by the reader compare equal.
///
/// # Examples
///
/// ```
/// use gatewarden::CredentialId;
///
/// let id = CredentialId::new("  0a1b2c3d4e5f ");
/// assert_eq!(id.as_str(), "0A1B2C3D4E5F");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CredentialId(String);

impl CredentialId {
    /// Creates a normalized credential id.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    /// Returns this id cut down to at most `max_chars` characters.
    ///
    /// Readers only report the first `tag_len - 1` characters of a tag, so
    /// stored ids are keyed on the same prefix.
    #[must_use]
    pub fn truncated(self, max_chars: usize) -> Self {
        match self.0.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => Self(self.0[..byte_idx].to_string()),
            None => self,
        }
    }

    /// Applies an optional key length.
    #[must_use]
    pub fn keyed(self, key_len: Option<usize>) -> Self {
        match key_len {
            Some(len) => self.truncated(len),
            None => self,
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is empty after normalization.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CredentialId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for CredentialId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<CredentialId> for String {
    fn from(id: CredentialId) -> Self {
        id.0
    }
}

/// Authorization record for one credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// The tag id (unique key).
    pub credential_id: CredentialId,
    /// The resident the tag belongs to.
    pub resident_id: String,
    /// The address (gate) the resident may open.
    pub address_id: String,
    /// Whether the credential currently grants access.
    pub active: bool,
    /// Last modification time at the remote store; drives last-write-wins.
    pub last_updated: DateTime<Utc>,
}

impl CredentialRecord {
    /// Creates an active record.
    #[must_use]
    pub fn new(
        credential_id: impl Into<CredentialId>,
        resident_id: impl Into<String>,
        address_id: impl Into<String>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            credential_id: credential_id.into(),
            resident_id: resident_id.into(),
            address_id: address_id.into(),
            active: true,
            last_updated,
        }
    }

    /// Returns the same record with the authorization flag set.
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Returns true if this record should replace `current` under
    /// last-write-wins.
    ///
    /// Equal timestamps are broken on `(active, resident_id, address_id)`,
    /// greater wins, so every delivery order settles on the same record and
    /// replaying a record is a no-op.
    #[must_use]
    pub fn supersedes(&self, current: &Self) -> bool {
        self.last_updated
            .cmp(&current.last_updated)
            .then_with(|| self.tiebreak().cmp(&current.tiebreak()))
            .is_gt()
    }

    fn tiebreak(&self) -> (bool, &str, &str) {
        (self.active, &self.resident_id, &self.address_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_id_normalization() {
        assert_eq!(CredentialId::new(" abc123 ").as_str(), "ABC123");
        assert_eq!(CredentialId::from("abc"), CredentialId::new("ABC"));
        assert!(CredentialId::new("   ").is_empty());
    }

    #[test]
    fn test_truncation_matches_reader_prefix() {
        let id = CredentialId::new("0123456789ABCDEF");
        assert_eq!(id.clone().truncated(12).as_str(), "0123456789AB");
        assert_eq!(id.clone().truncated(64), id);
        assert_eq!(id.clone().keyed(None), id);
    }

    #[test]
    fn test_serde_normalizes() {
        let id: CredentialId = serde_json::from_str("\"ab-12\"").unwrap();
        assert_eq!(id.as_str(), "AB-12");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"AB-12\"");
    }

    #[test]
    fn test_supersedes_last_write_wins() {
        let t0 = Utc::now();
        let old = CredentialRecord::new("A", "r1", "Main", t0);
        let newer = CredentialRecord::new("A", "r1", "Main", t0 + Duration::seconds(5)).with_active(false);

        assert!(newer.supersedes(&old));
        assert!(!old.supersedes(&newer));
        assert!(!old.supersedes(&old.clone()));

        let inactive = old.clone().with_active(false);
        assert!(old.supersedes(&inactive));
        assert!(!inactive.supersedes(&old));

        let moved = CredentialRecord::new("A", "r1", "Side", t0);
        assert!(moved.supersedes(&old));
        assert!(!old.supersedes(&moved));
    }
}

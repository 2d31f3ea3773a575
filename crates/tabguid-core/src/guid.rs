//! Durable tab identity tokens.
//!
//! A [`Guid`] is a random version-4 style identifier rendered in the usual
//! `8-4-4-4-12` hex layout. It is minted once per logical tab and never
//! changes, even when the host reassigns the tab's volatile id.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Durable identity of a logical tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    /// Mint a fresh random guid (122 random bits, RFC 4122 v4 layout).
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes: [u8; 16] = rand::random();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        let hex = hex::encode(bytes);
        Self(format!(
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        ))
    }

    /// Wrap an existing token, e.g. one read back from a snapshot.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Guid {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const MIN_IDENTITY_LEN: usize = 3;
const REDACTED_PREFIX_LEN: usize = 10;

/// Normalized claimed identity, usually a wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.chars().count() < MIN_IDENTITY_LEN {
            return Err(AppError::InvalidIdentity {
                identity: raw.to_string(),
                message: format!("Identity must be at least {MIN_IDENTITY_LEN} characters"),
            });
        }
        if normalized.chars().any(char::is_control) {
            return Err(AppError::InvalidIdentity {
                identity: raw.to_string(),
                message: "identity contains control characters".into(),
            });
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x` followed by exactly 40 hex digits.
    pub fn is_address(&self) -> bool {
        self.address_bytes().is_some()
    }

    pub fn address_bytes(&self) -> Option<[u8; 20]> {
        let digits = self.0.strip_prefix("0x")?;
        if digits.len() != 40 {
            return None;
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes).ok()?;
        Some(bytes)
    }

    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(REDACTED_PREFIX_LEN).collect();
        format!("{prefix}...")
    }

    /// File-name safe key for the enrollment store.
    pub fn storage_key(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

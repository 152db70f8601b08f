//! Auth Guard
//!
//! Maps request credentials (the `X-API-Key` header) to an authenticated
//! identity and privilege tier. Key comparison is constant-time over the
//! whole key table so response timing does not reveal which key prefix
//! matched, or whether any key exists at all.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::ApiKeyEntry;
use crate::error::GatewayError;

/// Privilege tier attached to an API key.
///
/// Tiers are ordered: `ReadOnly < Operator < Admin`. A policy rule declares
/// the minimum tier it requires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    /// May run read-only diagnostic commands
    ReadOnly,
    /// May run the full whitelisted command set
    Operator,
    /// May additionally change security posture
    Admin,
}

impl std::fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PrivilegeTier::ReadOnly => "read_only",
            PrivilegeTier::Operator => "operator",
            PrivilegeTier::Admin => "admin",
        };
        write!(f, "{}", s)
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identity name from the key table
    pub id: String,

    /// Privilege tier granted to this identity
    pub tier: PrivilegeTier,
}

/// Validates caller credentials against the configured key table.
#[derive(Debug, Clone)]
pub struct AuthGuard {
    keys: Vec<ApiKeyEntry>,
}

impl AuthGuard {
    /// Build a guard from configured key entries.
    pub fn new(keys: Vec<ApiKeyEntry>) -> Self {
        Self { keys }
    }

    /// Authenticate a presented API key.
    ///
    /// Every configured key is compared in constant time and the loop never
    /// exits early, so timing is independent of which (if any) entry matched.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` when the key is missing or matches no entry.
    pub fn authenticate(&self, presented: Option<&str>) -> Result<Identity, GatewayError> {
        let presented = presented.ok_or(GatewayError::Unauthorized)?;
        if presented.is_empty() {
            return Err(GatewayError::Unauthorized);
        }

        let presented_bytes = presented.as_bytes();
        let mut matched: Option<&ApiKeyEntry> = None;

        for entry in &self.keys {
            let candidate = entry.key.as_bytes();
            // ct_eq requires equal lengths; mismatched lengths compare a
            // same-length dummy so per-entry work stays uniform.
            let equal = if candidate.len() == presented_bytes.len() {
                bool::from(candidate.ct_eq(presented_bytes))
            } else {
                let dummy = vec![0u8; presented_bytes.len()];
                let _ = bool::from(dummy.ct_eq(presented_bytes));
                false
            };
            if equal && matched.is_none() {
                matched = Some(entry);
            }
        }

        match matched {
            Some(entry) => Ok(Identity {
                id: entry.identity.clone(),
                tier: entry.tier,
            }),
            None => Err(GatewayError::Unauthorized),
        }
    }

    /// Check that an identity meets a required tier.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when the identity's tier is below `required`.
    pub fn require_tier(
        &self,
        identity: &Identity,
        required: PrivilegeTier,
    ) -> Result<(), GatewayError> {
        if identity.tier >= required {
            Ok(())
        } else {
            Err(GatewayError::Forbidden)
        }
    }

    /// Number of configured keys.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

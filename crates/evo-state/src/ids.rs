//! Typed identifiers and content fingerprints

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifier of a campaign
    CampaignId
);
entity_id!(
    /// Identifier of a round
    RoundId
);
entity_id!(
    /// Identifier of a variant
    VariantId
);
entity_id!(
    /// Identifier of a single (variant, evaluator) evaluation
    EvaluationId
);
entity_id!(
    /// Identifier of one version of a policy
    PolicyId
);
entity_id!(
    /// Identifier of a decision record
    DecisionId
);
entity_id!(
    /// Correlates every decision written while executing one round
    TraceId
);

/// SHA-256 fingerprint of a variant's content (lowercase hex).
///
/// Used for deduplication within a round and as a cheap similarity signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Fingerprint the given content.
    pub fn of(content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        ContentFingerprint(hex::encode(hasher.finalize()))
    }

    /// Rebuild from a stored hex string.
    pub fn from_hex(s: impl Into<String>) -> Option<Self> {
        let s = s.into();
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(ContentFingerprint(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }

    /// Shared hex-prefix length over total length, in `[0, 1]`.
    pub fn similarity(&self, other: &ContentFingerprint) -> f64 {
        let shared = self
            .0
            .bytes()
            .zip(other.0.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        shared as f64 / self.0.len().max(1) as f64
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Opaque identifiers used as storage keys.
//!
//! Every id ends up as a path component under the artifacts directory, so all
//! of them go through [`validate_id`] before they touch the filesystem.

use std::fmt;

use anyhow::{Result, anyhow};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const MAX_ID_LEN: usize = 128;

/// Validate that `id` is safe to use as a single path component.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(anyhow!("id must be at most {MAX_ID_LEN} bytes"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// 128 random bits, hex encoded.
fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(random_token())
            }

            /// Parse an externally supplied id.
            pub fn parse(raw: &str) -> Result<Self> {
                validate_id(raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(raw: String) -> Result<Self> {
                validate_id(&raw)?;
                Ok(Self(raw))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(
    /// Identifies one external-process invocation.
    JobId
);
opaque_id!(
    /// Identifies an insight artifact within a session.
    ArtifactId
);
opaque_id!(
    /// Identifies a proposal.
    ProposalId
);
opaque_id!(
    /// Identifies a conversation session in the agent's history.
    SessionId
);

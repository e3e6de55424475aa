//! Parse-at-boundaries identifier newtypes.
//!
//! Every identifier that crosses a component boundary is validated exactly
//! once, at construction, and thereafter carries its validity in its type.
//! Handlers accept `AgentId`/`LockKey`/`FeatureId`/`TaskId` rather than
//! `String`, so a malformed identifier can never reach persistence.

use std::fmt;

const MAX_IDENTIFIER_LENGTH: usize = 256;
const RESERVED_KEYWORDS: &[&str] = &["null", "undefined", "none", "nil"];

/// Errors raised while parsing an identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    /// The identifier was empty.
    #[error("identifier must not be empty")]
    Empty,
    /// The identifier exceeded [`MAX_IDENTIFIER_LENGTH`].
    #[error("identifier too long: {actual} > {max}")]
    TooLong {
        /// The configured maximum.
        max: usize,
        /// The actual length observed.
        actual: usize,
    },
    /// The identifier contained characters outside the allowed charset.
    #[error("identifier contains invalid characters: {details}")]
    InvalidCharacters {
        /// A human-readable description of what was rejected.
        details: String,
    },
    /// The identifier collided with a reserved keyword.
    #[error("identifier uses a reserved keyword: {keyword}")]
    ReservedKeyword {
        /// Which keyword matched.
        keyword: String,
    },
}

fn validate_generic(raw: &str) -> Result<(), IdentifierError> {
    if raw.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if raw.len() > MAX_IDENTIFIER_LENGTH {
        return Err(IdentifierError::TooLong {
            max: MAX_IDENTIFIER_LENGTH,
            actual: raw.len(),
        });
    }
    if let Some(keyword) = RESERVED_KEYWORDS
        .iter()
        .find(|&&kw| kw.eq_ignore_ascii_case(raw))
    {
        return Err(IdentifierError::ReservedKeyword {
            keyword: (*keyword).to_string(),
        });
    }
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(IdentifierError::InvalidCharacters {
            details: format!("{raw:?} must be ASCII alphanumeric, '-', '_', '.' or ':'"),
        });
    }
    Ok(())
}

macro_rules! identifier_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate a raw string into this identifier type.
            pub fn parse(raw: impl Into<String>) -> Result<Self, IdentifierError> {
                let raw = raw.into();
                validate_generic(&raw)?;
                Ok(Self(raw))
            }

            /// Borrow the underlying string.
            #[must_use]
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
            type Error = IdentifierError;
            fn try_from(raw: String) -> Result<Self, Self::Error> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

identifier_newtype!(AgentId, "An agent's stable identifier.");
identifier_newtype!(SessionId, "A session identifier, unique per (agent, session).");
identifier_newtype!(FeatureId, "A human-chosen feature identifier, stable across its lifecycle.");

/// A lock key: an opaque string naming a file path or a logical resource.
/// Lock keys are deliberately permissive (they are frequently file paths)
/// but must still be non-empty and free of NUL bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockKey(String);

impl LockKey {
    /// Parse and validate a raw string into a [`LockKey`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdentifierError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if raw.len() > MAX_IDENTIFIER_LENGTH {
            return Err(IdentifierError::TooLong {
                max: MAX_IDENTIFIER_LENGTH,
                actual: raw.len(),
            });
        }
        if raw.contains('\0') {
            return Err(IdentifierError::InvalidCharacters {
                details: "lock keys must not contain NUL bytes".into(),
            });
        }
        Ok(Self(raw))
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LockKey {
    type Error = IdentifierError;
    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl From<LockKey> for String {
    fn from(value: LockKey) -> Self {
        value.0
    }
}

/// A task identifier. Tasks are assigned a UUID at submit time, but the
/// newtype still validates anything parsed back from persistence or a CLI
/// argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    /// Generate a fresh, random task id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse a task id from its textual UUID form.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        uuid::Uuid::parse_str(raw)
            .map(Self)
            .map_err(|e| IdentifierError::InvalidCharacters {
                details: e.to_string(),
            })
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_rejects_empty() {
        assert_eq!(AgentId::parse(""), Err(IdentifierError::Empty));
    }

    #[test]
    fn agent_id_rejects_reserved_keyword() {
        assert!(matches!(
            AgentId::parse("null"),
            Err(IdentifierError::ReservedKeyword { .. })
        ));
    }

    #[test]
    fn agent_id_accepts_normal_identifiers() {
        assert!(AgentId::parse("agent-alpha-01").is_ok());
    }

    #[test]
    fn lock_key_accepts_file_paths() {
        assert!(LockKey::parse("src/a.py").is_ok());
        assert!(LockKey::parse("logical:merge-queue").is_ok());
    }

    #[test]
    fn lock_key_rejects_nul() {
        assert!(LockKey::parse("a\0b").is_err());
    }

    #[test]
    fn task_id_roundtrips() {
        let id = TaskId::new();
        let parsed = TaskId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}

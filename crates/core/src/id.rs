//! Validated platform identifiers.
//!
//! Role, identity, and database names travel into platform statements, so
//! they are checked once at the boundary and carried as newtypes afterwards.
//! The platform folds unquoted identifiers to upper case; the newtypes do the
//! same so `db_ro` and `DB_RO` compare equal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum identifier length accepted by the platform.
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Why a string was rejected as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    /// Empty string.
    #[error("{kind} must not be empty")]
    Empty {
        /// What kind of identifier was being parsed
        kind: &'static str,
    },

    /// Longer than [`MAX_IDENTIFIER_LENGTH`].
    #[error("{kind} '{value}' exceeds maximum length of {MAX_IDENTIFIER_LENGTH} characters")]
    TooLong {
        /// What kind of identifier was being parsed
        kind: &'static str,
        /// The rejected value
        value: String,
    },

    /// Contains a character outside `[A-Z0-9_$]` or starts with a digit or `$`.
    #[error("{kind} '{value}' contains invalid character '{ch}'")]
    InvalidCharacter {
        /// What kind of identifier was being parsed
        kind: &'static str,
        /// The rejected value
        value: String,
        /// First offending character
        ch: char,
    },
}

fn is_tail_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '$'
}

fn normalize(kind: &'static str, raw: &str) -> Result<String, IdentifierError> {
    let value = raw.trim().to_ascii_uppercase();

    if value.is_empty() {
        return Err(IdentifierError::Empty { kind });
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(IdentifierError::TooLong { kind, value });
    }

    let mut chars = value.chars();
    if let Some(first) = chars.next()
        && !(first.is_ascii_uppercase() || first == '_')
    {
        return Err(IdentifierError::InvalidCharacter {
            kind,
            ch: first,
            value,
        });
    }
    if let Some(ch) = chars.find(|c| !is_tail_char(*c)) {
        return Err(IdentifierError::InvalidCharacter { kind, value, ch });
    }

    Ok(value)
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and normalize `value`.
            pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
                normalize($kind, value.as_ref()).map(Self)
            }

            /// The normalized, upper-case form.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdentifierError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdentifierError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdentifierError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
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

identifier!(
    /// Name of a platform role.
    RoleName,
    "role name"
);

identifier!(
    /// Name of a service identity (a platform user authenticated by key pair).
    IdentityId,
    "identity"
);

identifier!(
    /// Name of a database an access role is scoped to.
    DatabaseName,
    "database name"
);

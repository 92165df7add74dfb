//! Typed identifiers for memvault entities.
//!
//! Each identifier is a newtype wrapper around `String`, so a [`UserId`]
//! cannot be passed where a [`MemoryId`] is expected. [`UserId::sanitized`]
//! is the only way raw webhook user ids become storage-safe shard names.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier using UUID v4.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Return the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Identifier of the user a memory belongs to. Used as the shard name.
    UserId
);

define_id!(
    /// Identifier of a single memory (transcript) event.
    MemoryId
);

/// Shard name used when no usable user id was supplied.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Maximum length, in characters, of a sanitized user id.
const MAX_USER_ID_CHARS: usize = 50;

impl UserId {
    /// Build a storage-safe user id from an untrusted raw value.
    ///
    /// The result only contains `[a-z0-9_-]`, never starts or ends with `_`,
    /// holds no `__` runs and is at most 50 characters long. Missing or
    /// blank input, or input with nothing usable in it, maps to
    /// [`ANONYMOUS_USER`]. The function is idempotent.
    ///
    /// ```
    /// use memvault_core::types::UserId;
    ///
    /// assert_eq!(UserId::sanitized(Some("@Jane Doe!")).as_str(), "at_jane_doe");
    /// assert_eq!(UserId::sanitized(None).as_str(), "anonymous");
    /// ```
    pub fn sanitized(raw: Option<&str>) -> Self {
        Self(sanitize_user_id(raw))
    }

    /// Whether this is the shared anonymous shard.
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_USER
    }
}

fn sanitize_user_id(raw: Option<&str>) -> String {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return ANONYMOUS_USER.to_string(),
    };

    let truncated: String = raw.chars().take(MAX_USER_ID_CHARS).collect();
    let expanded = truncated.to_lowercase().replace('@', "at_");

    let mut collapsed = String::with_capacity(expanded.len());
    for c in expanded.chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    // `@` expansion can push past the limit, so cap once more.
    let capped: String = collapsed
        .trim_matches('_')
        .chars()
        .take(MAX_USER_ID_CHARS)
        .collect();
    let cleaned = capped.trim_end_matches('_');

    if cleaned.is_empty() {
        ANONYMOUS_USER.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Memory id used when the supplied one is blank.
pub const UNNAMED_MEMORY: &str = "unnamed";

impl MemoryId {
    /// Build a memory id that is safe as a single key or file-name segment.
    ///
    /// Characters outside `[A-Za-z0-9_-]` become `_`, so separators (`/`,
    /// `\`) and dot segments (`..`) never reach a storage key. Blank input
    /// maps to [`UNNAMED_MEMORY`]. Generated UUIDs pass through unchanged
    /// and the function is idempotent.
    pub fn sanitized(raw: &str) -> Self {
        let cleaned: String = raw
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            Self(UNNAMED_MEMORY.to_string())
        } else {
            Self(cleaned)
        }
    }

    /// Whether the id can be used as a key segment as-is.
    pub fn is_key_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

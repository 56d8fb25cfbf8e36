//! Branded newtype identifiers. Each wraps a UUIDv7 (time-sortable) string with a
//! distinguishing prefix so ids from different domains can't be mixed up at a type level.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! branded_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}{}", $prefix, uuid::Uuid::now_v7()))
            }

            /// Wrap an existing raw string without validating the prefix. Used when
            /// deserializing ids that originated upstream (e.g. synthesized tool-call ids).
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub const PREFIX: &'static str = $prefix;
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

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(RequestId, "req_");
branded_id!(EventId, "evt_");
branded_id!(ToolCallId, "toolu_");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_prefix() {
        let id = RequestId::new();
        assert!(id.as_str().starts_with("req_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_matches_as_str() {
        let id = ToolCallId::new();
        assert_eq!(format!("{id}"), id.as_str());
    }

    #[test]
    fn serde_roundtrip() {
        let id = RequestId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn from_raw_preserves_exact_string() {
        let id = ToolCallId::from_raw("toolu_custom_123");
        assert_eq!(id.as_str(), "toolu_custom_123");
    }

    #[test]
    fn v7_ids_sort_monotonically() {
        let mut ids: Vec<EventId> = (0..5).map(|_| EventId::new()).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort();
            s
        };
        ids.sort();
        assert_eq!(ids, sorted);
    }
}

//! Branded ID newtypes.
//!
//! Connection IDs are minted by the bridge (UUID v7, time-ordered). Request
//! and subscription IDs are chosen by callers and must be treated as
//! arbitrary untrusted strings; `new()` on those only exists for callers that
//! need to mint their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a new ID (prefixed UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "{}"), Uuid::now_v7()))
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier assigned to a socket when the bridge accepts it.
    ConnectionId, "conn_"
}

branded_id! {
    /// Correlation key of a request awaiting exactly one reply.
    RequestId, "auto-"
}

branded_id! {
    /// Caller-chosen key of a log-stream subscription.
    SubscriptionId, "sub_"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique_and_prefixed() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }

    #[test]
    fn generated_request_ids_use_auto_prefix() {
        assert!(RequestId::new().as_str().starts_with("auto-"));
    }

    #[test]
    fn caller_supplied_ids_are_kept_verbatim() {
        let id = RequestId::from("  weird id / with spaces ");
        assert_eq!(id.as_str(), "  weird id / with spaces ");
    }

    #[test]
    fn serde_is_transparent() {
        let id = SubscriptionId::from("s1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"s1\"");
        let back: SubscriptionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_matches_inner() {
        let id = ConnectionId::from("conn_x");
        assert_eq!(id.to_string(), "conn_x");
        assert_eq!(String::from(id), "conn_x");
    }
}

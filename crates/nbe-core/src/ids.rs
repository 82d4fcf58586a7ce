//! Branded ID newtypes.
//!
//! Group correlation ids and session ids are both opaque strings on the wire,
//! wrapped in distinct types so one can never be handed to an API expecting
//! the other. Fresh values are UUID v7 (time-ordered) from
//! [`uuid::Uuid::now_v7`], which makes them unique for the lifetime of the
//! process and beyond.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh ID (UUID v7).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
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

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
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
    /// Correlation id of one flushed task group.
    ///
    /// Assigned at flush time and echoed back by the agent as the key of its
    /// reply envelope.
    GroupId
}

branded_id! {
    /// Identity of one dispatch session (one agent connection).
    ///
    /// A host that reconnects gets a new session id, which lets the hub tell
    /// a stale session apart from its replacement.
    SessionId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn group_id_is_uuid_v7() {
        let id = GroupId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn group_ids_never_repeat() {
        let ids: HashSet<GroupId> = (0..10_000).map(|_| GroupId::new()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn session_and_group_ids_differ() {
        let s = SessionId::new();
        let g = GroupId::new();
        assert_ne!(s.as_str(), g.as_str());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = GroupId::from("g-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"g-1\"");
        let back: GroupId = serde_json::from_str("\"g-1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn borrow_allows_str_lookup() {
        let mut set = HashSet::new();
        let _ = set.insert(GroupId::from("lookup"));
        assert!(set.contains("lookup"));
    }

    #[test]
    fn display_and_into_string() {
        let id = SessionId::from("sess-9");
        assert_eq!(format!("{id}"), "sess-9");
        let s: String = id.into();
        assert_eq!(s, "sess-9");
    }
}

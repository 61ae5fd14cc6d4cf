//! Unique identifiers for registrations, subscriptions, snapshots and events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new unique ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the hyphenated string form.
            ///
            /// # Errors
            ///
            /// Returns an error if the string is not a valid UUID.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a bus handler registration.
    HandlerId
);
uuid_id!(
    /// Identifier of a bus filter.
    FilterId
);
uuid_id!(
    /// Identifier of an emitted event.
    EventId
);
uuid_id!(
    /// Identifier of a state subscription.
    SubscriptionId
);
uuid_id!(
    /// Identifier of a state snapshot.
    SnapshotId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(HandlerId::new(), HandlerId::new());
    }

    #[test]
    fn test_parse_round_trip() {
        let id = SnapshotId::new();
        let parsed = SnapshotId::parse(&id.to_string()).expect("valid uuid");
        assert_eq!(parsed, id);
        assert!(SnapshotId::parse("not-a-uuid").is_err());
    }
}

//! Strongly-typed identifiers for audit records.
//!
//! Identifiers are opaque strings so that rows written by any backend can be
//! read back without parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4()))
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

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a recorded run (complete or skipped).
    RunId,
    "run"
);
string_id!(
    /// Identifier of an action proposed by the analysis provider.
    ActionId,
    "action"
);
string_id!(
    /// Identifier of a stored decision record.
    DecisionId,
    "decision"
);
string_id!(
    /// Identifier of a stored trigger record.
    TriggerId,
    "trigger"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("run-"));
        assert!(DecisionId::generate().as_str().starts_with("decision-"));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ActionId::new("pay-supplier-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"pay-supplier-42\"");
    }
}

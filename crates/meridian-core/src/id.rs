//! Opaque identifiers used across the control plane.
//!
//! All ids are newtypes over `String` so they cannot be confused with one
//! another at call sites. They serialize transparently as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// View the id as a string slice.
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

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Identifies a worker node connected to the gateway.
    NodeId
}

string_id! {
    /// Identifies an agent selectable by binding rules.
    AgentId
}

string_id! {
    /// Identifies an external messaging channel.
    ChannelId
}

string_id! {
    /// A derived conversation identifier.
    ///
    /// Produced by the conversation scoper; a pure function of scope and
    /// routing context, so equal inputs always yield equal keys.
    ConversationKey
}

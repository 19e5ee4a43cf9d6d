//! Workflow identity types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one assignment workflow
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a fresh random workflow ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the raw UUID
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkflowId({})", self.0)
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Box<str>);

        impl $name {
            /// Wrap a raw identifier
            pub fn new(id: impl Into<Box<str>>) -> Self {
                Self(id.into())
            }

            /// Raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.into())
            }
        }
    };
}

string_id!(
    /// Tenant on whose behalf a workflow runs and whose balance is charged
    ResellerId
);
string_id!(
    /// Identifier of a client record in the external registry
    ClientRef
);
string_id!(
    /// Partner-side order reference; also the key of a poll subscription
    JobRef
);
string_id!(
    /// Identifier of a purchasable bundle in the partner catalogue
    BundleId
);

/// Get current time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_display_raw_value() {
        let job = JobRef::new("ord-42");
        assert_eq!(job.to_string(), "ord-42");
        assert_eq!(format!("{:?}", job), "JobRef(ord-42)");
        assert_eq!(ResellerId::from("r1").as_str(), "r1");
    }

    #[test]
    fn workflow_ids_are_unique() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }
}

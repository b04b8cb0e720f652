//! Identity types for workflow instances and their branches.
//!
//! A workflow instance is addressed by an [`InstanceKey`]: the workflow type it
//! was configured under plus the correlation id threaded through every branch
//! event. Records are versioned with [`Version`] for compare-and-set updates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an identifier from untrusted input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a ", $kind, " without validation (trusted input).")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[doc = concat!("Borrow the ", $kind, " as a string slice.")]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[doc = concat!("Consume the ", $kind, " and return the inner `String`.")]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
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

string_id!(
    /// Identifier threading every event that belongs to one workflow instance.
    ///
    /// Opaque to the barrier; typically the trace id assigned upstream.
    ///
    /// ```
    /// use fanin_core::correlation::CorrelationId;
    ///
    /// let id: CorrelationId = "trace-1".parse().unwrap();
    /// assert_eq!(id.as_str(), "trace-1");
    /// assert!("".parse::<CorrelationId>().is_err());
    /// ```
    CorrelationId,
    "correlation id"
);

string_id!(
    /// Topic name a branch publishes its completion under (e.g. `inventory.checked`).
    BranchTag,
    "branch tag"
);

string_id!(
    /// Name of a configured workflow shape (e.g. `order-processing`).
    WorkflowType,
    "workflow type"
);

/// Storage key of a workflow instance.
///
/// Two workflow types may reuse a correlation id without sharing state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Workflow type the instance was created under.
    pub workflow_type: WorkflowType,
    /// Correlation id of the instance.
    pub correlation_id: CorrelationId,
}

impl InstanceKey {
    /// Build a key from its parts.
    #[must_use]
    pub const fn new(workflow_type: WorkflowType, correlation_id: CorrelationId) -> Self {
        Self {
            workflow_type,
            correlation_id,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_type, self.correlation_id)
    }
}

/// Record version used for optimistic concurrency control.
///
/// [`Version::INITIAL`] means "no record stored yet". Every successful
/// compare-and-set bumps the version by one, so a writer holding a stale
/// version is rejected instead of silently overwriting a concurrent update.
///
/// ```
/// use fanin_core::correlation::Version;
///
/// let v = Version::INITIAL.next();
/// assert_eq!(v.value(), 1);
/// assert!(!v.is_initial());
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version of a record that has never been written.
    pub const INITIAL: Self = Self(0);

    /// Create a version from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The version a successful write produces.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether no record has been written yet.
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_ids() {
        assert!("".parse::<CorrelationId>().is_err());
        assert!("   ".parse::<BranchTag>().is_err());
        assert!("order-processing".parse::<WorkflowType>().is_ok());
    }

    #[test]
    fn parse_error_names_the_kind() {
        let err = "".parse::<CorrelationId>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid correlation id: cannot be empty");
    }

    #[test]
    fn instance_key_display() {
        let key = InstanceKey::new(
            WorkflowType::new("order-processing"),
            CorrelationId::new("trace-1"),
        );
        assert_eq!(key.to_string(), "order-processing/trace-1");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let tag = BranchTag::new("order.validated");
        let json = serde_json::to_string(&tag).unwrap();
        assert_eq!(json, "\"order.validated\"");
    }

    #[test]
    fn version_progression() {
        assert!(Version::INITIAL.is_initial());
        assert_eq!(Version::INITIAL.next().next(), Version::new(2));
        assert!(Version::new(1) < Version::new(2));
    }
}

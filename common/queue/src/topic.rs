use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a logical stream that records are produced to and consumed from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty topic is never a valid destination.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy of this topic with `suffix` appended, handy when
    /// deriving per-environment or per-test topic names.
    pub fn with_suffix(&self, suffix: &str) -> Topic {
        Topic(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic(value.to_owned())
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic(value)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

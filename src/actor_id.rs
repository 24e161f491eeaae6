use std::fmt::{self, Display};
use uuid::{NoContext, Timestamp, Uuid};

/// An opaque actor instance ID. Must not contain slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorId(String);

impl ActorId {
    /// A fresh, time-ordered random ID.
    pub fn random() -> Self {
        Self(Uuid::new_v7(Timestamp::now(NoContext)).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

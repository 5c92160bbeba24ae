use std::fmt::{Debug, Display, Formatter};

#[cfg(test)] use mockall::automock;
use serde::{Deserialize, Serialize};

/// Every endpoint of the protocol is identified by an [Identity]. It is generated once when a
///  session is created and stays stable for the session's lifetime - it is the `from` / `to`
///  discriminator in every envelope.
///
/// NB: An identity is opaque. Nothing in this crate parses it, and it is *not* a security
///       feature: it only has to be collision-free for the lifetime of the participating
///       sessions.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Identity {
        Identity(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity(value.to_string())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Identity(value)
    }
}


/// Source of fresh identities, injected into a session so tests (and applications with their
///  own naming scheme) can control them.
#[cfg_attr(test, automock)]
pub trait IdAllocator: Send + Sync {
    fn next_id(&self) -> Identity;
}

pub struct UuidIdAllocator {}
impl IdAllocator for UuidIdAllocator {
    fn next_id(&self) -> Identity {
        Identity(uuid::Uuid::new_v4().to_string())
    }
}

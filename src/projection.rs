//! Typed operations and the projection interface.
//!
//! The log treats payloads as opaque JSON. Databases built on top of it agree on
//! an [`Operation`] shape and replay the log's values into a queryable view through
//! a [`Projection`]. Concrete views (key-value, documents, counters) live with the
//! application.

use crate::Result;
use crate::entry::{Entry, Payload};
use serde::{Deserialize, Serialize};

/// An operation carried in an entry payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum Operation {
    Put { key: String, value: serde_json::Value },
    Del { key: String },
    Add { value: serde_json::Value },
}

impl Operation {
    pub fn to_payload(&self) -> Result<Payload> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(Operation::deserialize(payload)?)
    }
}

/// A view rebuilt by replaying operations in log order.
pub trait Projection: Default {
    /// Apply one operation. `entry` is the entry that carried it.
    fn apply(&mut self, operation: Operation, entry: &Entry);

    /// Replay `entries` (normally [`Log::values`](crate::Log::values)) into a fresh view.
    ///
    /// Entries whose payload is not an [`Operation`] are skipped.
    fn replay<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut view = Self::default();
        for entry in entries {
            if let Ok(operation) = Operation::from_payload(entry.payload()) {
                view.apply(operation, entry);
            }
        }
        view
    }
}

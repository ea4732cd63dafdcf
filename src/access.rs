//! Write authorization for logs.
//!
//! The log consults an [`AccessController`] for every entry it accepts, both for
//! local appends and for entries merged in from peers. Policies are free to be as
//! elaborate as they like; the log only depends on the single `can_append` predicate.

use crate::Result;
use crate::constants::ANY_WRITER;
use crate::entry::Entry;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

/// Decides whether an entry may be added to a log.
#[async_trait]
pub trait AccessController: Send + Sync + fmt::Debug {
    /// Returns `true` if the entry's declared identity may append its payload.
    async fn can_append(&self, entry: &Entry) -> Result<bool>;
}

/// Grants write access to an explicit set of identity ids.
///
/// The special writer `"*"` opens the log to everyone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteAccess {
    writers: BTreeSet<String>,
}

impl WriteAccess {
    pub fn new<I, S>(writers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            writers: writers.into_iter().map(Into::into).collect(),
        }
    }

    /// Anyone may append.
    pub fn open() -> Self {
        Self::new([ANY_WRITER])
    }

    /// Only the given identity (normally the log creator) may append.
    pub fn owner_only(owner: impl Into<String>) -> Self {
        Self::new([owner.into()])
    }

    pub fn writers(&self) -> impl Iterator<Item = &str> {
        self.writers.iter().map(String::as_str)
    }

    pub fn allows(&self, identity_id: &str) -> bool {
        self.writers.contains(ANY_WRITER) || self.writers.contains(identity_id)
    }
}

#[async_trait]
impl AccessController for WriteAccess {
    async fn can_append(&self, entry: &Entry) -> Result<bool> {
        Ok(self.allows(&entry.identity().id))
    }
}

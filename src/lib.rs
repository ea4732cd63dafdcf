//!
//! Peerlog: a peer-to-peer database built on a shared, append-only operation log.
//! This library provides the log, its storage contract and the replication plumbing
//! that lets independent writers converge on the same history without a coordinator.
//!
//! ## Core Concepts
//!
//! * **Entries (`entry::Entry`)**: Immutable, signed, content-addressed DAG nodes. The unit of replication.
//! * **Clocks (`clock::Clock`)**: Per-writer Lamport timestamps used for causal ordering and tie-breaks.
//! * **Logs (`log::Log`)**: The CRDT. Owns the frontier of heads and implements `append`, `join` and traversal.
//! * **Storage (`storage::Storage`)**: A pluggable key to bytes store backing entries, heads and caches.
//! * **Identities (`identity::Identity`)**: Writers that can sign, with self-signed proofs binding id and key.
//! * **Access controllers (`access::AccessController`)**: The `can_append` predicate enforced on every entry.
//! * **Databases (`database::Database`)**: Wrap a log for one dataset, broadcast local writes and sync remote ones.
//! * **Heads exchange (`exchange::HeadsExchange`)**: Direct peer protocol that ships only the current heads
//!   on first contact, seeding fast convergence.

pub mod access;
pub mod clock;
pub mod config;
pub mod constants;
pub mod database;
pub mod entry;
pub mod exchange;
pub mod identity;
pub mod log;
pub mod projection;
pub mod pubsub;
pub mod storage;

pub use database::Database;
pub use entry::{Entry, Hash};
pub use log::Log;

/// Result type used throughout the Peerlog library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Peerlog library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Entry not found")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Cryptographic signature verification failed
    #[error("Invalid signature")]
    InvalidSignature,

    /// Public key parsing or format validation failed
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// The access controller refused the entry
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed entry, identity proof, or causal linkage
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entry belongs to log {found}, expected {expected}")]
    LogIdMismatch { expected: String, found: String },

    /// An ancestor could not be fetched
    #[error("Could not resolve {hash}: {reason}")]
    Resolution { hash: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Closed")]
    Closed,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Fetch timeouts and unresolvable ancestors are transient: the missing block
    /// may show up once more peers are reachable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Resolution { .. })
    }
}

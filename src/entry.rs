//!
//! Defines the fundamental unit of replication (`Entry`) and related types.
//!
//! An `Entry` is an immutable, signed, content-addressed node in the log's DAG.
//! Entries link to their causal parents through `next` and to older ancestors
//! through `refs`, both by hash, so a link means the same thing on every peer.

use crate::clock::Clock;
use crate::constants::{ENTRY_VERSION, JSON_CODEC, SHA2_256};
use crate::identity::{self, Identity, IdentityRecord};
use crate::{Error, Result};
use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Content address of an entry: the CIDv1 string of its canonical encoding.
pub type Hash = String;

/// Opaque operation value defined by the layer above the log.
pub type Payload = serde_json::Value;

/// Derive the content address of a block of bytes.
///
/// The address is a CIDv1 with the `json` codec and a sha2-256 multihash, so the
/// same bytes yield the same address in any implementation that follows the
/// CID conventions.
pub fn content_address(bytes: &[u8]) -> Result<Hash> {
    let digest = Sha256::digest(bytes);
    let multihash = Multihash::<64>::wrap(SHA2_256, digest.as_slice())
        .map_err(|e| Error::Validation(format!("Failed to wrap digest: {e}")))?;
    Ok(Cid::new_v1(JSON_CODEC, multihash).to_string())
}

/// Fields covered by an entry signature.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a str,
    payload: &'a Payload,
    clock: &'a Clock,
    next: &'a [Hash],
    refs: &'a [Hash],
    v: u32,
    key: &'a str,
}

/// A finalized, signed log entry.
///
/// # Immutability
///
/// Entries cannot be modified after signing. Build them with [`EntryBuilder`]
/// (via [`Entry::builder`]) or decode them from bytes with [`Entry::decode`];
/// in both cases the content address is computed once the entry is complete.
///
/// # Example
///
/// ```
/// # use peerlog::entry::Entry;
/// # use peerlog::clock::Clock;
/// # use peerlog::identity::{Identity, KeyIdentity};
/// let identity = KeyIdentity::generate();
/// let entry = Entry::builder("my-log", serde_json::json!({"op": "put"}))
///     .clock(Clock::new(identity.id(), 1))
///     .sign(&identity)
///     .unwrap();
///
/// let decoded = Entry::decode(&entry.encode().unwrap()).unwrap();
/// assert_eq!(decoded.hash(), entry.hash());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    /// Id of the log this entry belongs to.
    id: String,
    payload: Payload,
    clock: Clock,
    /// Causal parents, sorted and de-duplicated.
    next: Vec<Hash>,
    /// Older ancestors at exponentially increasing distance.
    refs: Vec<Hash>,
    v: u32,
    /// Public key the entry is signed with.
    key: String,
    identity: IdentityRecord,
    sig: String,
    #[serde(skip)]
    hash: Hash,
}

impl Entry {
    /// Build and sign an entry in one step.
    ///
    /// `next` holds the hashes of the causal parents and `refs` older ancestors
    /// sampled with [`references`].
    pub fn create(
        identity: &dyn Identity,
        log_id: impl Into<String>,
        payload: Payload,
        clock: Clock,
        next: Vec<Hash>,
        refs: Vec<Hash>,
    ) -> Result<Self> {
        Self::builder(log_id, payload)
            .clock(clock)
            .next(next)
            .refs(refs)
            .sign(identity)
    }

    /// Creates a new `EntryBuilder` for an entry in the given log.
    pub fn builder(log_id: impl Into<String>, payload: Payload) -> EntryBuilder {
        EntryBuilder::new(log_id, payload)
    }

    /// Decode an entry from its wire bytes and derive its content address.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let entry: Entry = serde_json::from_slice(bytes)?;
        entry.seal()
    }

    /// Canonical encoding: the bytes that are broadcast, stored and hashed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Recompute the content address from the entry's fields.
    ///
    /// Needed after deserializing an entry through serde directly, since the
    /// address is never trusted from the wire.
    pub(crate) fn seal(mut self) -> Result<Self> {
        self.hash = content_address(&self.encode()?)?;
        Ok(self)
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Id of the log this entry belongs to.
    pub fn log_id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn next(&self) -> &[Hash] {
        &self.next
    }

    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }

    pub fn version(&self) -> u32 {
        self.v
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn identity(&self) -> &IdentityRecord {
        &self.identity
    }

    pub fn signature(&self) -> &str {
        &self.sig
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let fields = SignedFields {
            id: &self.id,
            payload: &self.payload,
            clock: &self.clock,
            next: &self.next,
            refs: &self.refs,
            v: self.v,
            key: &self.key,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    /// Check the entry signature against the key declared in its identity.
    ///
    /// This does not check the identity's own proofs; see [`IdentityRecord::verify`].
    pub fn verify_signature(&self) -> Result<bool> {
        if self.key != self.identity.public_key {
            return Ok(false);
        }
        identity::verify(&self.sig, &self.key, &self.signing_bytes()?)
    }

    /// Whether `expected` is the content address of this entry.
    pub fn verify_hash(&self, expected: &str) -> bool {
        self.hash == expected
    }

    /// Whether this entry is a direct causal parent of `child`.
    pub fn is_parent(&self, child: &Entry) -> bool {
        child.next.contains(&self.hash)
    }

    /// Deterministic total order over entries: clock time, then writer id, then hash.
    ///
    /// Since a child's clock is always ahead of its parents', sorting by this
    /// order never places an entry before one of its ancestors.
    pub fn causal_cmp(&self, other: &Entry) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    /// Sort key behind [`Entry::causal_cmp`]: `(time, writer, hash)`.
    pub fn order_key(&self) -> (u64, &str, &str) {
        (self.clock.time, &self.clock.id, &self.hash)
    }
}

/// Pick backward references from a writer's history.
///
/// `history` lists ancestors newest first, so `history[0]` sits at distance 1
/// (it is the direct parent and already covered by `next`). References are taken
/// at distances 2, 4, 8, ... up to `min(pointer_count, history.len())`, giving
/// `floor(log2(min(pointer_count, history.len())))` references.
pub fn references(history: &[Hash], pointer_count: usize) -> Vec<Hash> {
    let limit = pointer_count.min(history.len());
    let mut refs = Vec::new();
    let mut distance = 2;
    while distance <= limit {
        refs.push(history[distance - 1].clone());
        distance *= 2;
    }
    refs
}

/// A builder for creating signed `Entry` instances.
///
/// # Example
///
/// ```
/// # use peerlog::entry::Entry;
/// # use peerlog::clock::Clock;
/// # use peerlog::identity::{Identity, KeyIdentity};
/// let identity = KeyIdentity::generate();
/// let entry = Entry::builder("log", serde_json::json!("hello"))
///     .clock(Clock::new(identity.id(), 3))
///     .add_next("parent-b")
///     .add_next("parent-a")
///     .sign(&identity)
///     .unwrap();
/// assert_eq!(entry.next(), ["parent-a", "parent-b"]);
/// ```
#[derive(Clone, Debug)]
pub struct EntryBuilder {
    id: String,
    payload: Payload,
    clock: Option<Clock>,
    next: Vec<Hash>,
    refs: Vec<Hash>,
}

impl EntryBuilder {
    pub fn new(log_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: log_id.into(),
            payload,
            clock: None,
            next: Vec::new(),
            refs: Vec::new(),
        }
    }

    /// Set the writer clock. Defaults to time 1 for the signing identity.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the causal parents.
    /// The list is sorted and de-duplicated when the entry is signed.
    pub fn next(mut self, next: Vec<Hash>) -> Self {
        self.next = next;
        self
    }

    pub fn add_next(mut self, parent: impl Into<Hash>) -> Self {
        self.next.push(parent.into());
        self
    }

    /// Set the backward references. Any reference already present in `next` is dropped.
    pub fn refs(mut self, refs: Vec<Hash>) -> Self {
        self.refs = refs;
        self
    }

    /// Sign the entry and compute its content address.
    ///
    /// Fails if the identity cannot sign.
    pub fn sign(mut self, identity: &dyn Identity) -> Result<Entry> {
        self.next.sort();
        self.next.dedup();

        let mut refs = Vec::with_capacity(self.refs.len());
        for reference in self.refs {
            if !self.next.contains(&reference) && !refs.contains(&reference) {
                refs.push(reference);
            }
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Clock::new(identity.id(), 1));

        let mut entry = Entry {
            id: self.id,
            payload: self.payload,
            clock,
            next: self.next,
            refs,
            v: ENTRY_VERSION,
            key: identity.public_key().to_string(),
            identity: identity.record().clone(),
            sig: String::new(),
            hash: Hash::new(),
        };
        entry.sig = identity.sign(&entry.signing_bytes()?)?;
        entry.seal()
    }
}

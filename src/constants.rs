//! Constants used throughout the Peerlog library.
//!
//! Central definitions for defaults and for the reserved record names the log and
//! database persist next to their entries.

use std::time::Duration;

/// Default cap on the number of backward references (`refs`) an entry carries.
pub const DEFAULT_POINTER_COUNT: usize = 64;

/// Default bound on a single ancestor fetch during `join`.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Entry format version, part of the signed fields.
pub const ENTRY_VERSION: u32 = 2;

/// Key suffix under which a log stores its current heads.
pub const HEADS_KEY: &str = "_heads";

/// Record name for heads produced by the local writer.
pub const LOCAL_HEADS: &str = "_localHeads";

/// Record name for heads received from peers.
pub const REMOTE_HEADS: &str = "_remoteHeads";

/// Access controller entry granting write access to every identity.
pub const ANY_WRITER: &str = "*";

/// Multicodec code for JSON payloads, used when deriving content identifiers.
pub(crate) const JSON_CODEC: u64 = 0x0200;

/// Multihash code for sha2-256.
pub(crate) const SHA2_256: u64 = 0x12;

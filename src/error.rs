//! Error taxonomy (§7).
//!
//! Three tiers, matching §7's split: internal failures propagate as
//! [`CacheError`] via `?`; protocol-level outcomes a well-behaved
//! client can expect and must branch on are typed result values
//! ([`LookupOutcome`], [`AddEntryOutcome`]) rather than `Err` variants,
//! since a cache miss or a mismatched free-variable set isn't a
//! failure of the RPC itself; and frame-level problems are
//! [`WireError`], which the server turns into a dropped connection
//! rather than a reply (a peer that can't be trusted to frame
//! requests correctly can't be trusted to parse an error reply
//! either). The instance-fingerprint guard (§7 "instance mismatch")
//! is none of these three: it's carried inline in every RPC's own
//! reply envelope as the match bit §6 specifies, so the connection
//! stays open and the caller's next RPC can retry with a refreshed
//! fingerprint — see [`crate::server::handle_connection`].

use crate::entry::Ci;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Frame-level failures. Unlike [`CacheError`], these never reach a
/// client as a reply — the connection that triggered one is simply
/// closed (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed request frame")]
    BadFrame,
    #[error("unknown RPC opcode {0}")]
    UnknownOpcode(u8),
    #[error("connection closed by peer")]
    ConnectionClosed,
}

/// `Lookup`'s outcome (§4.I, §7). Every variant is a normal, expected
/// reply — none of them indicate a server fault.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// A matching entry was found.
    Hit(Ci, Vec<u8>),
    /// No entry in the PKFile had a matching CFP at all, or a CFP
    /// bucket matched but every candidate's free-variable values
    /// diverged from the query under its `IMap` (I3).
    Miss,
    /// The caller's dictionary epoch is stale: the PKFile's
    /// free-variable dictionary has grown since the caller last fetched
    /// it via `FreeVariables`, so the positional `fps` it sent no longer
    /// line up with the current `NameId`s.
    FvMismatch,
    /// The request itself was malformed (e.g. a fps vector whose
    /// length didn't match the supplied names list).
    BadLookupArgs,
}

/// `AddEntry`'s outcome (§4.I, §7).
#[derive(Debug, Clone)]
pub enum AddEntryOutcome {
    EntryAdded(Ci),
    /// The PK the client is adding to has no outstanding lease on a
    /// CI the server can associate this entry with (I4).
    NoLease,
    BadAddEntryArgs,
}

/// `Checkpoint`'s outcome (§4.I step 1, §7): every `ci` the caller
/// asks to root must currently be leased, or the whole call is refused
/// rather than rooting a CI that may already be a weed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Done,
    NoLease,
}

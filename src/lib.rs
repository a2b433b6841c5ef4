//! A function-call cache server: clients submit the free variables a
//! build step depended on and get back either a cached result or
//! permission to compute and submit one (`Lookup`/`AddEntry`), and a
//! background weeder reclaims entries no live client still leases.
//!
//! # Recovery
//!
//! On startup, [`pipeline::Pipeline::recover`] replays the cache log
//! and the CI interval log into the volatile store, advancing the CI
//! allocator past every index either log mentions. The stable store
//! itself needs no replay — it's only ever replaced wholesale, via
//! write-temp-then-rename, so it's always self-consistent on disk. A
//! crash during the weeder's mark phase is recovered by restarting
//! from `Normal` and relying on a client to re-drive `StartMark`,
//! since nothing durable was committed yet; a crash during deletion
//! resumes directly in `Deleting` with its stableVars-backed target,
//! via [`weeder::Weeder::recover_into_deleting`].
//!
//! # Locking
//!
//! Three kinds of shared state get their own lock: the weeder's state
//! machine, the CI allocator, and each PK-prefix group's
//! [`volatile::VMultiPkFile`]. Code that needs more than one of these
//! at once must take them in that order — weeder, then allocator,
//! then a `VMultiPkFile` — to avoid deadlocking against the
//! checkpoint and weeder-sweep paths, which take the same locks from
//! the other direction.
//!
//! # Instance identity
//!
//! Every server process mints a fresh, effectively-unique fingerprint
//! at startup (`server::instance`). Clients present it on every call
//! after their first; a mismatch means the server restarted underneath
//! them and every CI they're holding may refer to something that no
//! longer exists the way they remember it (I6) — the client must start
//! its build state over, not merely retry.

pub mod bitvector;
pub mod ci;
pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod leases;
pub mod log;
pub mod pipeline;
pub mod pkprefix;
pub mod server;
pub mod store;
pub mod volatile;
pub mod weeder;

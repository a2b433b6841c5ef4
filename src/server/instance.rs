//! The per-process instance fingerprint (§4.H, I6).
//!
//! A client that spans a server restart is holding CIs, leases, and
//! epochs that may no longer mean anything — the weeder could have run,
//! the volatile store is gone, lease grace periods have reset. Rather
//! than detect every one of those conditions individually, the server
//! mints one opaque fingerprint at startup and every RPC but
//! `GetCacheInstance` carries it; a mismatch means "start over", not
//! "retry" (§9 "Instance fingerprint replaces a previous scheme of
//! per-call nonces").
//!
//! §4.H's normative inputs are host, port, the stable-directory path,
//! process start time, and a monotonic counter. The counter is the part
//! an exact port of the source would get wrong (§9's open question):
//! wall-clock time alone can repeat across two processes that start in
//! the same tick on the same address. Persisting a generation number
//! under [`crate::config::Config::instance_marker_path`] and
//! incrementing it on every startup makes the counter actually
//! monotonic across restarts, not just within one process's lifetime.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

use crate::fingerprint::Fingerprint;

/// Read the prior generation number from `path` (0 if this is the
/// first startup), write back the incremented value, and return it.
/// Write-temp-then-rename, matching every other durable write in this
/// crate (I5).
fn next_generation(path: &Path) -> Result<u64> {
    let prior: u64 = match std::fs::read_to_string(path) {
        Ok(s) => s.trim().parse().unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e).context("reading instance generation marker"),
    };
    let next = prior.wrapping_add(1);
    let tmp = path.with_extension("tmp-write");
    std::fs::write(&tmp, next.to_string())
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(next)
}

/// Compute this process's instance fingerprint, bumping the persisted
/// generation counter at `marker_path` as a side effect. Called exactly
/// once, at server startup.
pub fn compute(
    host: &str,
    port: u16,
    stable_dir: &Path,
    marker_path: &Path,
) -> Result<Fingerprint> {
    let generation = next_generation(marker_path)?;
    let start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let tag = format!(
        "{}:{}:{}:{}:{}",
        host,
        port,
        stable_dir.display(),
        start,
        generation
    );
    Ok(Fingerprint::of_bytes(tag.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_counter_persists_and_increments_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("instance");
        let stable = dir.path().join("sCache");

        let a = compute("127.0.0.1", 21000, &stable, &marker).unwrap();
        let b = compute("127.0.0.1", 21000, &stable, &marker).unwrap();
        assert_ne!(a, b, "two computations at the same address must not collide");
    }

    #[test]
    fn missing_marker_file_starts_at_generation_one() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("instance");
        assert!(!marker.exists());
        compute("h", 1, dir.path(), &marker).unwrap();
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "1");
    }
}

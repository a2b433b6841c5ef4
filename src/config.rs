//! Server configuration and on-disk layout (§6).
//!
//! Vesta's own cache server takes a flat `key = value` config file
//! (traditionally `vesta.cfg`'s `[CacheServer]` section) rather than
//! anything hierarchical, so that's the format kept here — a tiny
//! hand-rolled parser, not a pull of `serde`/`toml` this crate has no
//! other use for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Default bind port, matching the original's `VestaCache` default
/// service port.
pub const DEFAULT_PORT: u16 = 21000;

#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the stable store (`sCache/gran-N/...`, §6).
    pub scache_dir: PathBuf,
    /// Root for the logs and the instance-fingerprint file.
    pub metadata_dir: PathBuf,
    pub listen_addr: String,
    pub listen_port: u16,
    pub thread_pool_size: usize,
    pub lease_timeout: Duration,
    pub checkpoint_interval: Duration,
}

impl Config {
    /// A config rooted at `base`, with every path and timing knob at
    /// its default value. `cached` starts from this and overlays
    /// whatever the config file and CLI flags override.
    pub fn defaults_under(base: &Path) -> Self {
        Config {
            scache_dir: base.join("sCache"),
            metadata_dir: base.join("meta"),
            listen_addr: "127.0.0.1".to_string(),
            listen_port: DEFAULT_PORT,
            thread_pool_size: 16,
            lease_timeout: Duration::from_secs(600),
            checkpoint_interval: Duration::from_secs(3600),
        }
    }

    /// Parse a `vesta.cfg`-style file: `#`-comments, blank lines,
    /// `[section]` headers (ignored — everything lives in one
    /// namespace here), and `key = value` pairs.
    pub fn load(base: &Path, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut kv = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("{}:{}: expected `key = value`, got {:?}", path.display(), lineno + 1, raw);
            };
            kv.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut cfg = Config::defaults_under(base);
        if let Some(v) = kv.get("SCache_dir") {
            cfg.scache_dir = base.join(v);
        }
        if let Some(v) = kv.get("Metadata_dir") {
            cfg.metadata_dir = base.join(v);
        }
        if let Some(v) = kv.get("CacheLogHost") {
            cfg.listen_addr = v.clone();
        }
        if let Some(v) = kv.get("CachePort") {
            cfg.listen_port = v
                .parse()
                .with_context(|| format!("CachePort {:?} is not a valid port", v))?;
        }
        if let Some(v) = kv.get("ThreadPoolSize") {
            cfg.thread_pool_size = v
                .parse()
                .with_context(|| format!("ThreadPoolSize {:?} is not a valid size", v))?;
        }
        if let Some(v) = kv.get("LeaseTimeoutSecs") {
            let secs: u64 = v
                .parse()
                .with_context(|| format!("LeaseTimeoutSecs {:?} is not a valid integer", v))?;
            cfg.lease_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = kv.get("CheckpointIntervalSecs") {
            let secs: u64 = v.parse().with_context(|| {
                format!("CheckpointIntervalSecs {:?} is not a valid integer", v)
            })?;
            cfg.checkpoint_interval = Duration::from_secs(secs);
        }
        Ok(cfg)
    }

    pub fn cache_log_path(&self) -> PathBuf {
        self.metadata_dir.join("cache.log")
    }

    pub fn graph_log_path(&self) -> PathBuf {
        self.metadata_dir.join("graph.log")
    }

    pub fn empty_pk_log_path(&self) -> PathBuf {
        self.metadata_dir.join("empty_pk.log")
    }

    /// CI allocator interval log (§4.A, §6 `ciLog/`, I2): every
    /// allocation and every weeder-driven free, appended and fsynced
    /// before the RPC that caused it replies.
    pub fn ci_log_path(&self) -> PathBuf {
        self.metadata_dir.join("ci.log")
    }

    /// §6 `stableVars/`: small durable flags the weeder's state
    /// machine needs to survive a restart mid-sweep.
    pub fn stable_vars_dir(&self) -> PathBuf {
        self.metadata_dir.join("stableVars")
    }

    pub fn deleting_flag_path(&self) -> PathBuf {
        self.stable_vars_dir().join("deleting")
    }

    pub fn hit_filter_path(&self) -> PathBuf {
        self.stable_vars_dir().join("hitFilter")
    }

    pub fn mpks_to_weed_path(&self) -> PathBuf {
        self.stable_vars_dir().join("mpksToWeed")
    }

    /// The `cis` half of `EndMark`'s pending deletion target — kept
    /// separate from the hit filter (which stays live across
    /// `CommitChkpt`'s transition back to `Normal`, where this doesn't).
    pub fn pending_deletion_path(&self) -> PathBuf {
        self.stable_vars_dir().join("pendingDeletion")
    }

    /// §6 `graphLog/<version>.ckp`: where `CommitChkpt` renames the
    /// weeder-written checkpoint into place.
    pub fn graph_log_checkpoint_path(&self, name: &str) -> PathBuf {
        self.metadata_dir.join("graphLogCheckpoints").join(name)
    }

    pub fn graph_log_checkpoint_dir(&self) -> PathBuf {
        self.metadata_dir.join("graphLogCheckpoints")
    }

    /// Where the server's per-instance fingerprint (H, I6) is
    /// persisted across restarts — not that it ever needs to be
    /// *reused*, only that its bytes never collide with a
    /// still-running sibling on the same filesystem.
    pub fn instance_marker_path(&self) -> PathBuf {
        self.metadata_dir.join("instance")
    }

    /// Count the on-disk MultiPKFiles under `sCache/gran-N/`, for the
    /// recovery-startup log line. A full recursive walk rather than a
    /// single `read_dir` since the granularity directory is itself two
    /// levels of prefix-arc subdirectories (§3, [`crate::pkprefix`]).
    pub fn stable_multipkfile_count(&self) -> Result<usize> {
        let gran_dir = self.scache_dir.join(format!("gran-{}", crate::pkprefix::GRANULARITY));
        if !gran_dir.exists() {
            return Ok(0);
        }
        let count = walkdir::WalkDir::new(&gran_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == "multi")
            .count();
        Ok(count)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.scache_dir)
            .with_context(|| format!("creating {}", self.scache_dir.display()))?;
        std::fs::create_dir_all(&self.metadata_dir)
            .with_context(|| format!("creating {}", self.metadata_dir.display()))?;
        std::fs::create_dir_all(self.stable_vars_dir())
            .with_context(|| format!("creating {}", self.stable_vars_dir().display()))?;
        std::fs::create_dir_all(self.graph_log_checkpoint_dir())
            .with_context(|| format!("creating {}", self.graph_log_checkpoint_dir().display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs_and_ignores_comments_and_sections() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("vesta.cfg");
        std::fs::write(
            &cfg_path,
            "[CacheServer]\n# a comment\nCachePort = 9999\nThreadPoolSize = 4\n",
        )
        .unwrap();

        let cfg = Config::load(dir.path(), &cfg_path).unwrap();
        assert_eq!(cfg.listen_port, 9999);
        assert_eq!(cfg.thread_pool_size, 4);
    }

    #[test]
    fn rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("vesta.cfg");
        std::fs::write(&cfg_path, "not-a-kv-line\n").unwrap();
        assert!(Config::load(dir.path(), &cfg_path).is_err());
    }

    #[test]
    fn counts_multipkfiles_across_prefix_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::defaults_under(dir.path());
        assert_eq!(cfg.stable_multipkfile_count().unwrap(), 0);

        let gran_dir = cfg.scache_dir.join(format!("gran-{}", crate::pkprefix::GRANULARITY));
        for arcs in [["aa", "bb"], ["cc", "dd"]] {
            let group_dir = gran_dir.join(arcs[0]).join(arcs[1]);
            std::fs::create_dir_all(&group_dir).unwrap();
            std::fs::write(group_dir.join("multi"), b"").unwrap();
        }

        assert_eq!(cfg.stable_multipkfile_count().unwrap(), 2);
    }
}

//! Append-only, checkpoint-rotated logs (§4.B, §4.G, §9).
//!
//! Three logs share one on-disk shape: a sequence of CRC32-checked,
//! length-prefixed frames, appended under `O_APPEND` semantics and
//! replayed front-to-back on recovery. A frame whose CRC doesn't match
//! (a torn write from a crash mid-append) ends replay at that frame
//! instead of failing it — the log is a prefix of durable records, not
//! an all-or-nothing unit.
//!
//! - [`cache_log`]: every `AddEntry`, so a crash between a commit and
//!   the next checkpoint doesn't lose entries (B).
//! - `graph_log` (below, in [`graph_log`]): the dependency edges the
//!   weeder's mark phase walks (G).
//! - [`empty_pk_log`]: PKs a checkpoint just flushed into the stable
//!   store, so recovery can tell a stale, not-yet-rotated cache log
//!   record apart from one that's still only volatile.

pub mod cache_log;
pub mod empty_pk_log;
pub mod graph_log;

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// One CRC32-framed record: `[len: u32][crc32: u32][payload]`.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let crc = crc32fast::hash(payload);
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(&crc.to_be_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

/// Read one frame, or `None` at a clean EOF. Returns `None` (rather than
/// an error) on a truncated or CRC-mismatched tail frame too, since
/// that's exactly the shape a crash mid-append leaves behind and
/// recovery should treat it as "nothing more to replay", not a fatal
/// corruption.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = r.read_exact(&mut len_buf) {
        return if e.kind() == io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    if r.read_exact(&mut crc_buf).is_err() {
        return Ok(None);
    }
    let want_crc = u32::from_be_bytes(crc_buf);

    let mut payload = vec![0u8; len];
    if r.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if crc32fast::hash(&payload) != want_crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// An append-only log file with checkpoint rotation.
pub struct AppendLog {
    path: PathBuf,
    file: BufWriter<File>,
}

impl AppendLog {
    /// Open (creating if absent) for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(AppendLog {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, payload: &[u8]) -> io::Result<()> {
        write_frame(&mut self.file, payload)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()
    }

    /// Replay every record currently on disk, in order.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<u8>>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(path)?);
        let mut out = Vec::new();
        while let Some(rec) = read_frame(&mut reader)? {
            out.push(rec);
        }
        Ok(out)
    }

    /// Checkpoint rotation: atomically replace the log with an empty
    /// one (the checkpoint now holds everything it recorded). Matches
    /// the write-temp-then-rename durability discipline used for the
    /// stable store itself (I5).
    pub fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let tmp = self.path.with_extension("tmp-rotate");
        File::create(&tmp)?.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.file = BufWriter::new(file);
        Ok(())
    }
}

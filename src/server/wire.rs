//! Wire framing and per-RPC (de)serialization (§6 "Wire protocol").
//!
//! A hand-rolled framed binary protocol over any `Read + Write` stream
//! (`TcpStream` in production, an in-memory buffer in tests) — not
//! HTTP/REST. A `hyper`/REST-style stack is built around a request/
//! response router keyed on paths and methods; this server's transport
//! is a generic synchronous request/response stream RPC fixed only at
//! its framing boundary, which is a different shape of problem
//! entirely. Primitive encodings: unsigned integers big-endian, texts
//! and sequences length-prefixed by a 32-bit count, matching §6
//! exactly.
//!
//! Every RPC except `GetCacheInstance` starts with the client sending
//! the 128-bit instance fingerprint; the server replies with one bool
//! before anything else. [`read_request`]/[`write_reply`] handle that
//! envelope so [`crate::server`]'s dispatch loop only ever sees
//! already-validated requests and well-formed replies.

use std::io::{self, Read, Write};

use crate::bitvector::BitVector;
use crate::entry::Ci;
use crate::error::{AddEntryOutcome, LookupOutcome, WireError};
use crate::fingerprint::Fingerprint;
use crate::pipeline::{FreeVar, FreeVariables};
use crate::pkprefix::PkPrefix;
use crate::weeder::WeederState;

// -- Primitive encodings (§6) --------------------------------------

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_bool<W: Write>(w: &mut W, v: bool) -> io::Result<()> {
    write_u8(w, v as u8)
}

pub fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    Ok(read_u8(r)? != 0)
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub fn write_bytes<W: Write>(w: &mut W, v: &[u8]) -> io::Result<()> {
    write_u32(w, v.len() as u32)?;
    w.write_all(v)
}

pub fn read_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_string<W: Write>(w: &mut W, v: &str) -> io::Result<()> {
    write_bytes(w, v.as_bytes())
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_fp<W: Write>(w: &mut W, fp: Fingerprint) -> io::Result<()> {
    fp.write_to(w)
}

fn read_fp<R: Read>(r: &mut R) -> io::Result<Fingerprint> {
    Fingerprint::read_from(r)
}

fn write_ci_list<W: Write>(w: &mut W, cis: &[Ci]) -> io::Result<()> {
    write_u32(w, cis.len() as u32)?;
    for &ci in cis {
        write_u32(w, ci)?;
    }
    Ok(())
}

fn read_ci_list<R: Read>(r: &mut R) -> io::Result<Vec<Ci>> {
    let n = read_u32(r)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(read_u32(r)?);
    }
    Ok(out)
}

fn write_fp_list<W: Write>(w: &mut W, fps: &[Fingerprint]) -> io::Result<()> {
    write_u32(w, fps.len() as u32)?;
    for &fp in fps {
        write_fp(w, fp)?;
    }
    Ok(())
}

fn read_fp_list<R: Read>(r: &mut R) -> io::Result<Vec<Fingerprint>> {
    let n = read_u32(r)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(read_fp(r)?);
    }
    Ok(out)
}

// -- RPC numbering (§6 "RPC set") -----------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    FreeVariables = 1,
    Lookup = 2,
    AddEntry = 3,
    Checkpoint = 4,
    RenewLeases = 5,
    WeederRecovering = 6,
    StartMark = 7,
    SetHitFilter = 8,
    GetLeases = 9,
    ResumeLeaseExp = 10,
    EndMark = 11,
    CommitChkpt = 12,
    GetCacheInstance = 13,
    FlushAll = 14,
    GetCacheId = 15,
    GetCacheState = 16,
}

impl Opcode {
    /// `GetCacheInstance` is the one call that doesn't carry the
    /// instance-guard envelope — a client with no instance fingerprint
    /// yet has to be able to ask for one (§6).
    pub fn needs_instance_guard(self) -> bool {
        !matches!(self, Opcode::GetCacheInstance)
    }

    fn from_u8(b: u8) -> Result<Self, WireError> {
        Ok(match b {
            1 => Opcode::FreeVariables,
            2 => Opcode::Lookup,
            3 => Opcode::AddEntry,
            4 => Opcode::Checkpoint,
            5 => Opcode::RenewLeases,
            6 => Opcode::WeederRecovering,
            7 => Opcode::StartMark,
            8 => Opcode::SetHitFilter,
            9 => Opcode::GetLeases,
            10 => Opcode::ResumeLeaseExp,
            11 => Opcode::EndMark,
            12 => Opcode::CommitChkpt,
            13 => Opcode::GetCacheInstance,
            14 => Opcode::FlushAll,
            15 => Opcode::GetCacheId,
            16 => Opcode::GetCacheState,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

// -- Requests --------------------------------------------------------

#[derive(Debug)]
pub enum Request {
    FreeVariables { pk: Fingerprint },
    Lookup { pk: Fingerprint, epoch: u64, fps: Vec<Fingerprint> },
    AddEntry {
        pk: Fingerprint,
        names: Vec<(String, u8)>,
        fps: Vec<Fingerprint>,
        value: Vec<u8>,
        model: Fingerprint,
        kids: Vec<Ci>,
        source_func: String,
    },
    Checkpoint { cis: Vec<Ci>, done: bool },
    RenewLeases { cis: Vec<Ci> },
    WeederRecovering,
    StartMark,
    SetHitFilter { cis: Vec<Ci> },
    GetLeases,
    ResumeLeaseExp,
    EndMark { cis: Vec<Ci>, pfxs: Vec<u64> },
    CommitChkpt { name: String },
    GetCacheInstance,
    FlushAll,
    GetCacheId,
    GetCacheState,
}

/// Read one request frame: `[opcode: u8][instance fp if guarded][args]`.
/// Returns the opcode, the client's claimed instance fingerprint (if
/// this RPC carries one), and the decoded request body.
pub fn read_request<R: Read>(r: &mut R) -> Result<(Opcode, Option<Fingerprint>, Request), WireError> {
    let opcode = Opcode::from_u8(read_u8(r).map_err(|_| WireError::ConnectionClosed)?)?;
    let instance = if opcode.needs_instance_guard() {
        Some(read_fp(r).map_err(|_| WireError::BadFrame)?)
    } else {
        None
    };

    let body = (|| -> io::Result<Request> {
        Ok(match opcode {
            Opcode::FreeVariables => Request::FreeVariables { pk: read_fp(r)? },
            Opcode::Lookup => {
                let pk = read_fp(r)?;
                let epoch = read_u64(r)?;
                let fps = read_fp_list(r)?;
                Request::Lookup { pk, epoch, fps }
            }
            Opcode::AddEntry => {
                let pk = read_fp(r)?;
                let n = read_u32(r)?;
                let mut names = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let name = read_string(r)?;
                    let kind = read_u8(r)?;
                    names.push((name, kind));
                }
                let fps = read_fp_list(r)?;
                let value = read_bytes(r)?;
                let model = read_fp(r)?;
                let kids = read_ci_list(r)?;
                let source_func = read_string(r)?;
                Request::AddEntry {
                    pk,
                    names,
                    fps,
                    value,
                    model,
                    kids,
                    source_func,
                }
            }
            Opcode::Checkpoint => {
                let cis = read_ci_list(r)?;
                let done = read_bool(r)?;
                Request::Checkpoint { cis, done }
            }
            Opcode::RenewLeases => Request::RenewLeases { cis: read_ci_list(r)? },
            Opcode::WeederRecovering => {
                let _done_marking = read_bool(r)?;
                Request::WeederRecovering
            }
            Opcode::StartMark => Request::StartMark,
            Opcode::SetHitFilter => Request::SetHitFilter { cis: read_ci_list(r)? },
            Opcode::GetLeases => Request::GetLeases,
            Opcode::ResumeLeaseExp => Request::ResumeLeaseExp,
            Opcode::EndMark => {
                let cis = read_ci_list(r)?;
                let n = read_u32(r)?;
                let mut pfxs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    pfxs.push(read_u64(r)?);
                }
                Request::EndMark { cis, pfxs }
            }
            Opcode::CommitChkpt => Request::CommitChkpt { name: read_string(r)? },
            Opcode::GetCacheInstance => Request::GetCacheInstance,
            Opcode::FlushAll => Request::FlushAll,
            Opcode::GetCacheId => Request::GetCacheId,
            Opcode::GetCacheState => Request::GetCacheState,
        })
    })()
    .map_err(|_| WireError::BadFrame)?;

    Ok((opcode, instance, body))
}

impl Request {
    /// Bridge a wire `AddEntry`'s parallel `names`/`fps` arrays into
    /// the [`FreeVar`] list the pipeline wants, pairing them
    /// positionally (§6's `AddEntry` row: `names, fps` are parallel).
    pub fn add_entry_free_vars(names: &[(String, u8)], fps: &[Fingerprint]) -> Vec<FreeVar> {
        names
            .iter()
            .zip(fps.iter())
            .map(|((name, kind), &fp)| FreeVar {
                name: name.clone(),
                kind: *kind,
                fp,
            })
            .collect()
    }
}

// -- Replies -----------------------------------------------------------

/// One RPC's reply, already past the instance-guard bool (handled by
/// [`write_reply`]/[`read_reply`] below, not part of this type).
#[derive(Debug)]
pub enum Reply {
    FreeVariables(FreeVariables),
    Lookup(LookupOutcome),
    AddEntry(AddEntryOutcome),
    Checkpoint { no_lease: bool },
    RenewLeases { all_ok: bool },
    WeederRecovering { conflict: bool },
    StartMark { live_set: BitVector, new_log_ver: u64 },
    SetHitFilter,
    GetLeases { live_set: BitVector },
    ResumeLeaseExp,
    EndMark { chkpt_ver: u64 },
    CommitChkpt { accepted: bool },
    GetCacheInstance { instance_fp: Fingerprint },
    FlushAll,
    GetCacheId { cache_id: Fingerprint },
    GetCacheState {
        next_ci: Ci,
        live_cis: u64,
        leased_cis: u64,
        weeder_state: WeederState,
        new_hits: u64,
        warm_hits: u64,
        disk_hits: u64,
        all_misses: u64,
    },
}

const STATUS_OK: u8 = 0;
const STATUS_FAILURE: u8 = 1;

/// Send a `send_failure(code, msg)` frame (§6): terminates the call
/// with an error instead of a normal reply.
pub fn write_failure<W: Write>(w: &mut W, code: u32, msg: &str) -> io::Result<()> {
    write_u8(w, STATUS_FAILURE)?;
    write_u32(w, code)?;
    write_string(w, msg)
}

/// Write a normal reply: the instance-guard bool (if this opcode
/// carries one) followed by the RPC-specific payload. If `instance_ok`
/// is false, nothing past the bool is written — the call is aborted
/// (§6 "the server aborts the call with a specific error").
pub fn write_reply<W: Write>(
    w: &mut W,
    opcode: Opcode,
    instance_ok: bool,
    reply: &Reply,
) -> io::Result<()> {
    write_u8(w, STATUS_OK)?;
    if opcode.needs_instance_guard() {
        write_bool(w, instance_ok)?;
        if !instance_ok {
            return Ok(());
        }
    }

    match reply {
        Reply::FreeVariables(fv) => {
            write_bool(w, fv.is_empty)?;
            write_u32(w, fv.names.len() as u32)?;
            for (name, kind) in &fv.names {
                write_string(w, name)?;
                write_u8(w, *kind)?;
            }
            write_u64(w, fv.epoch)?;
        }
        Reply::Lookup(outcome) => match outcome {
            LookupOutcome::Hit(ci, value) => {
                write_u8(w, 0)?;
                write_u32(w, *ci)?;
                write_bytes(w, value)?;
            }
            LookupOutcome::Miss => write_u8(w, 1)?,
            LookupOutcome::FvMismatch => write_u8(w, 2)?,
            LookupOutcome::BadLookupArgs => write_u8(w, 3)?,
        },
        Reply::AddEntry(outcome) => match outcome {
            AddEntryOutcome::EntryAdded(ci) => {
                write_u32(w, *ci)?;
                write_u8(w, 0)?;
            }
            AddEntryOutcome::NoLease => {
                write_u32(w, 0)?;
                write_u8(w, 1)?;
            }
            AddEntryOutcome::BadAddEntryArgs => {
                write_u32(w, 0)?;
                write_u8(w, 2)?;
            }
        },
        Reply::Checkpoint { no_lease } => write_bool(w, *no_lease)?,
        Reply::RenewLeases { all_ok } => write_bool(w, *all_ok)?,
        Reply::WeederRecovering { conflict } => write_bool(w, *conflict)?,
        Reply::StartMark { live_set, new_log_ver } => {
            live_set.write(w)?;
            write_u64(w, *new_log_ver)?;
        }
        Reply::SetHitFilter => {}
        Reply::GetLeases { live_set } => live_set.write(w)?,
        Reply::ResumeLeaseExp => {}
        Reply::EndMark { chkpt_ver } => write_u64(w, *chkpt_ver)?,
        Reply::CommitChkpt { accepted } => write_bool(w, *accepted)?,
        Reply::GetCacheInstance { instance_fp } => write_fp(w, *instance_fp)?,
        Reply::FlushAll => {}
        Reply::GetCacheId { cache_id } => write_fp(w, *cache_id)?,
        Reply::GetCacheState {
            next_ci,
            live_cis,
            leased_cis,
            weeder_state,
            new_hits,
            warm_hits,
            disk_hits,
            all_misses,
        } => {
            write_u32(w, *next_ci)?;
            write_u64(w, *live_cis)?;
            write_u64(w, *leased_cis)?;
            let tag = match weeder_state {
                WeederState::Normal => 0u8,
                WeederState::Marking => 1u8,
                WeederState::Deleting => 2u8,
            };
            write_u8(w, tag)?;
            write_u64(w, *new_hits)?;
            write_u64(w, *warm_hits)?;
            write_u64(w, *disk_hits)?;
            write_u64(w, *all_misses)?;
        }
    }
    Ok(())
}

/// Outcome of reading a reply frame: either the RPC's normal payload
/// (with the instance match bit folded in, so a caller can't
/// accidentally ignore a mismatch), or an out-of-band failure.
#[derive(Debug)]
pub enum ReplyOutcome {
    InstanceMismatch,
    Failure { code: u32, msg: String },
    Ok(Reply),
}

/// Decode one reply frame for `opcode`. Used by tests and by any
/// future client-side helper; the server itself only ever writes
/// replies via [`write_reply`].
pub fn read_reply<R: Read>(r: &mut R, opcode: Opcode) -> io::Result<ReplyOutcome> {
    let status = read_u8(r)?;
    if status == STATUS_FAILURE {
        let code = read_u32(r)?;
        let msg = read_string(r)?;
        return Ok(ReplyOutcome::Failure { code, msg });
    }

    if opcode.needs_instance_guard() {
        let ok = read_bool(r)?;
        if !ok {
            return Ok(ReplyOutcome::InstanceMismatch);
        }
    }

    let reply = match opcode {
        Opcode::FreeVariables => {
            let is_empty = read_bool(r)?;
            let n = read_u32(r)?;
            let mut names = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let name = read_string(r)?;
                let kind = read_u8(r)?;
                names.push((name, kind));
            }
            let epoch = read_u64(r)?;
            Reply::FreeVariables(FreeVariables { names, epoch, is_empty })
        }
        Opcode::Lookup => {
            let tag = read_u8(r)?;
            Reply::Lookup(match tag {
                0 => {
                    let ci = read_u32(r)?;
                    let value = read_bytes(r)?;
                    LookupOutcome::Hit(ci, value)
                }
                1 => LookupOutcome::Miss,
                2 => LookupOutcome::FvMismatch,
                _ => LookupOutcome::BadLookupArgs,
            })
        }
        Opcode::AddEntry => {
            let ci = read_u32(r)?;
            let tag = read_u8(r)?;
            Reply::AddEntry(match tag {
                0 => AddEntryOutcome::EntryAdded(ci),
                1 => AddEntryOutcome::NoLease,
                _ => AddEntryOutcome::BadAddEntryArgs,
            })
        }
        Opcode::Checkpoint => Reply::Checkpoint { no_lease: read_bool(r)? },
        Opcode::RenewLeases => Reply::RenewLeases { all_ok: read_bool(r)? },
        Opcode::WeederRecovering => Reply::WeederRecovering { conflict: read_bool(r)? },
        Opcode::StartMark => {
            let live_set = BitVector::read(r)?;
            let new_log_ver = read_u64(r)?;
            Reply::StartMark { live_set, new_log_ver }
        }
        Opcode::SetHitFilter => Reply::SetHitFilter,
        Opcode::GetLeases => Reply::GetLeases { live_set: BitVector::read(r)? },
        Opcode::ResumeLeaseExp => Reply::ResumeLeaseExp,
        Opcode::EndMark => Reply::EndMark { chkpt_ver: read_u64(r)? },
        Opcode::CommitChkpt => Reply::CommitChkpt { accepted: read_bool(r)? },
        Opcode::GetCacheInstance => Reply::GetCacheInstance { instance_fp: read_fp(r)? },
        Opcode::FlushAll => Reply::FlushAll,
        Opcode::GetCacheId => Reply::GetCacheId { cache_id: read_fp(r)? },
        Opcode::GetCacheState => {
            let next_ci = read_u32(r)?;
            let live_cis = read_u64(r)?;
            let leased_cis = read_u64(r)?;
            let tag = read_u8(r)?;
            let weeder_state = match tag {
                1 => WeederState::Marking,
                2 => WeederState::Deleting,
                _ => WeederState::Normal,
            };
            let new_hits = read_u64(r)?;
            let warm_hits = read_u64(r)?;
            let disk_hits = read_u64(r)?;
            let all_misses = read_u64(r)?;
            Reply::GetCacheState {
                next_ci,
                live_cis,
                leased_cis,
                weeder_state,
                new_hits,
                warm_hits,
                disk_hits,
                all_misses,
            }
        }
    };
    Ok(ReplyOutcome::Ok(reply))
}

/// Encode the `pfxs` MultiPKFile-prefix list `EndMark` carries as raw
/// prefix words, for callers assembling a request by hand (tests,
/// future client helper) rather than through [`read_request`].
pub fn write_prefixes<W: Write>(w: &mut W, pfxs: &[PkPrefix]) -> io::Result<()> {
    write_u32(w, pfxs.len() as u32)?;
    for p in pfxs {
        write_u64(w, p.raw())?;
    }
    Ok(())
}

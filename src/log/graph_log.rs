//! Graph log: the dependency edges the weeder's mark phase walks
//! (§4.F, §4.G).
//!
//! Recording `kids` edges separately from the entries themselves lets
//! the mark phase walk reachability without touching the stable store
//! at all — it only needs this log plus the current lease set (the
//! roots). Two record kinds: a `Node` gives one entry's children, and a
//! `Root` flags a CI that's alive independent of any lease (currently
//! only the weeder's own bookkeeping roots use this; see
//! [`crate::weeder`]).

use std::io::{self, Read, Write};

use crate::entry::Ci;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphLogRecord {
    Node { ci: Ci, kids: Vec<Ci> },
    Root { ci: Ci },
}

const TAG_NODE: u8 = 0;
const TAG_ROOT: u8 = 1;

impl GraphLogRecord {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            GraphLogRecord::Node { ci, kids } => {
                buf.write_all(&[TAG_NODE])?;
                buf.write_all(&ci.to_be_bytes())?;
                buf.write_all(&(kids.len() as u32).to_be_bytes())?;
                for k in kids {
                    buf.write_all(&k.to_be_bytes())?;
                }
            }
            GraphLogRecord::Root { ci } => {
                buf.write_all(&[TAG_ROOT])?;
                buf.write_all(&ci.to_be_bytes())?;
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<GraphLogRecord> {
        let mut r = bytes;
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag)?;
        match tag[0] {
            TAG_NODE => {
                let ci = read_ci(&mut r)?;
                let mut len_buf = [0u8; 4];
                r.read_exact(&mut len_buf)?;
                let n = u32::from_be_bytes(len_buf);
                let mut kids = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    kids.push(read_ci(&mut r)?);
                }
                Ok(GraphLogRecord::Node { ci, kids })
            }
            TAG_ROOT => Ok(GraphLogRecord::Root {
                ci: read_ci(&mut r)?,
            }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown graph log tag {}", other),
            )),
        }
    }
}

fn read_ci<R: Read>(r: &mut R) -> io::Result<Ci> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(Ci::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_round_trips() {
        let rec = GraphLogRecord::Node {
            ci: 3,
            kids: vec![4, 5, 6],
        };
        let bytes = rec.encode().unwrap();
        assert_eq!(GraphLogRecord::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn root_round_trips() {
        let rec = GraphLogRecord::Root { ci: 9 };
        let bytes = rec.encode().unwrap();
        assert_eq!(GraphLogRecord::decode(&bytes).unwrap(), rec);
    }
}

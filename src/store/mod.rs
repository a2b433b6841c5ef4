//! The stable store: on-disk PKFiles/MultiPKFiles and the name
//! dictionaries they share (§3, §4.C).

pub mod names;
pub mod pkfile;

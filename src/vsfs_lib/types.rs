//! Field aliases for on-media rows. Everything on media is little-endian;
//! the aliases keep the row declarations honest about it.
#![allow(non_camel_case_types)]

pub type le16 = u16;
pub type le32 = u32;
pub type le64 = u64;
pub type s16 = i16;
pub type s64 = i64;

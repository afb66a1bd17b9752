//! Identifier and row codecs.

pub mod cell_id;
pub mod row;

pub use cell_id::{DecodedId, MAX_SLICE, Partitioning};
pub use row::{decode_rows, encode_rows};

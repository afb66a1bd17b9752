//! In-memory columnar row blocks.

pub mod block;
pub mod value;

pub use block::{Row, RowBlock};
pub use value::{ColumnData, Value};

//! Storage engine: tablet files, headers, cell locks, and the cell store.

pub mod cell_store;
pub mod header;
pub mod lock;
pub mod tablet;

pub use cell_store::{CellStore, CellWriter};
pub use tablet::Tablet;

//! Public API: the catalog handle and its table and job builders.

pub mod builders;
pub mod catalog;

pub use builders::{JobBuilder, TableBuilder};
pub use catalog::{Catalog, CellTarget};

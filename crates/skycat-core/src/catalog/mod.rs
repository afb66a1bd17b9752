//! Catalog metadata storage and footprint resolution.

pub mod meta;
pub mod resolver;

pub use meta::{CatalogMeta, XmatchEntry};
pub use resolver::{Partition, resolve};

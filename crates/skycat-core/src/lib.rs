//! # skycat
//!
//! A spatially and temporally partitioned object catalog for large sky surveys.
//!
//! Objects are placed into cells of a hierarchical equal-area pixelization of
//! the sky (optionally split into time slices), and every cell of every table
//! is stored as its own tablet file. Queries are evaluated cell by cell on a
//! worker pool, with map-reduce for anything that aggregates across cells.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skycat_core::api::{Catalog, CellTarget};
//! use skycat_core::encoding::Partitioning;
//! use skycat_core::query::{Expr, Query};
//! use skycat_core::table::RowBlock;
//! use skycat_core::types::ColumnType;
//!
//! // Create a catalog partitioned at level 6, with 90-day time slices
//! let cat = Catalog::create("sdss", "sdss", Partitioning::new(6, 47892.0, 90.0).unwrap()).unwrap();
//!
//! // Create the primary table
//! cat.create_table("objects")
//!     .column("id", ColumnType::U64)
//!     .column("ra", ColumnType::F64)
//!     .column("dec", ColumnType::F64)
//!     .column("r", ColumnType::F32)
//!     .primary_key("id")
//!     .spatial_keys("ra", "dec")
//!     .execute()
//!     .unwrap();
//!
//! // Insert rows; ids are assigned per cell
//! let rows = RowBlock::new()
//!     .with_column("ra", ColumnType::F64, vec![10.0, 10.5])
//!     .unwrap()
//!     .with_column("dec", ColumnType::F64, vec![20.0, 20.5])
//!     .unwrap()
//!     .with_column("r", ColumnType::F32, vec![19.5, 22.0])
//!     .unwrap();
//! let ids = cat.append("objects", &rows, CellTarget::Derived).unwrap();
//! assert_eq!(ids.len(), 2);
//!
//! // Query the whole sky
//! let bright = cat
//!     .query(Query::select("id ra dec").filter(Expr::lt(Expr::col("r"), Expr::lit(21.0))))
//!     .fetch()
//!     .unwrap();
//! assert_eq!(bright.len(), 1);
//! ```

pub mod api;
pub mod catalog;
pub mod config;
pub mod encoding;
pub mod error;
pub mod geometry;
pub mod mapreduce;
pub mod query;
pub mod storage;
pub mod table;
pub mod types;

pub use api::{Catalog, CellTarget, JobBuilder, TableBuilder};
pub use config::{EngineConfig, LockPolicy};
pub use error::{Error, Result};

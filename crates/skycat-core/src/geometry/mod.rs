//! Geometry: sky projection, hierarchical pixelization, convex polygons.

pub mod polygon;
pub mod sky;

pub use polygon::{Footprint, Polygon};

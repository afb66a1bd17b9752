//! Spatial-temporal identifier codec.
//!
//! Prefix layout (upper 32 bits of an id):
//! ```text
//! [31..22] quantized x  (10 bits)
//! [21..12] quantized y  (10 bits)
//! [11..0]  time slice   (12 bits)
//! ```
//! The lower 32 bits hold the row serial (zero for a pure cell id).

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::geometry::sky;
use crate::types::{CellId, MAX_LEVEL};

const COORD_BITS: u32 = 10;
const COORD_SCALE: f64 = (1u32 << COORD_BITS) as f64;
const COORD_MASK: u32 = (1 << COORD_BITS) - 1;
const SLICE_MASK: u32 = 0xFFF;

/// Highest time slice a cell id can address.
pub const MAX_SLICE: u32 = SLICE_MASK;

/// Fraction of a slice tolerated below a slice boundary before flooring.
const SLICE_EPS: f64 = 1e-9;

/// Quantize a planar coordinate in `[-1, 1]` to 10 bits.
fn quantize(coord: f64) -> u32 {
    (((1.0 + coord) * 0.5 * COORD_SCALE).round() as i64).clamp(0, COORD_MASK as i64) as u32
}

fn dequantize(q: u32) -> f64 {
    2.0 * q as f64 / COORD_SCALE - 1.0
}

/// Pack a position and time slice into a cell prefix at `level`.
pub fn encode(x: f64, y: f64, slice: u32, level: u32) -> u32 {
    let (cx, cy) = sky::xy_center(x, y, level);
    (quantize(cx) << 22) | (quantize(cy) << 12) | (slice.min(SLICE_MASK))
}

/// Unpack an id into `(x, y, slice, serial)`, with `(x, y)` the pixel center at `level`.
pub fn decode(id: CellId, level: u32) -> (f64, f64, u32, u32) {
    let serial = id.serial();
    let prefix = id.prefix();
    let x = dequantize(prefix >> 22);
    let y = dequantize((prefix >> 12) & COORD_MASK);
    let (cx, cy) = sky::xy_center(x, y, level);
    (cx, cy, prefix & SLICE_MASK, serial)
}

/// A decoded identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedId {
    pub x: f64,
    pub y: f64,
    /// Start time of the cell's time slice.
    pub t: f64,
    pub slice: u32,
    pub serial: u32,
}

/// Partitioning parameters of a catalog: pixelization depth and time slicing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Partitioning {
    pub level: u32,
    /// Epoch origin (MJD).
    pub t0: f64,
    /// Time-slice width in days; 0 disables the time axis.
    pub dt: f64,
}

impl Default for Partitioning {
    fn default() -> Self {
        Self {
            level: 6,
            t0: 47892.0,
            dt: 90.0,
        }
    }
}

impl Partitioning {
    pub fn new(level: u32, t0: f64, dt: f64) -> Result<Self, SchemaError> {
        let p = Self { level, t0, dt };
        p.validate()?;
        Ok(p)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.level == 0 || self.level > MAX_LEVEL {
            return Err(SchemaError::InvalidLevel(self.level));
        }
        Ok(())
    }

    pub fn has_time_axis(&self) -> bool {
        self.dt > 0.0
    }

    /// Time slice index of `t`, clamped into `0..=4095`.
    pub fn time_slice(&self, t: Option<f64>) -> u32 {
        match t {
            Some(t) if self.has_time_axis() => {
                let s = ((t - self.t0) / self.dt + SLICE_EPS).floor();
                s.clamp(0.0, SLICE_MASK as f64) as u32
            }
            _ => 0,
        }
    }

    /// Absolute start time of a slice.
    pub fn slice_start(&self, slice: u32) -> f64 {
        if self.has_time_axis() {
            self.t0 + slice as f64 * self.dt
        } else {
            self.t0
        }
    }

    /// Cell containing planar position `(x, y)` at time `t`.
    pub fn cell_for_xy(&self, x: f64, y: f64, t: Option<f64>) -> CellId {
        self.cell_for_xy_slice(x, y, self.time_slice(t))
    }

    pub fn cell_for_xy_slice(&self, x: f64, y: f64, slice: u32) -> CellId {
        CellId::from_parts(encode(x, y, slice, self.level), 0)
    }

    /// Cell containing sky position `(ra, dec)` at time `t`.
    pub fn cell_for_pos(&self, ra: f64, dec: f64, t: Option<f64>) -> CellId {
        let (x, y) = sky::project(ra, dec);
        self.cell_for_xy(x, y, t)
    }

    pub fn decode(&self, id: CellId) -> DecodedId {
        let (x, y, slice, serial) = decode(id, self.level);
        DecodedId {
            x,
            y,
            t: self.slice_start(slice),
            slice,
            serial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn survey() -> Partitioning {
        Partitioning::new(6, 47892.0, 90.0).unwrap()
    }

    #[test]
    fn test_scenario_time_slices() {
        let p = survey();
        let a = p.cell_for_pos(10.0, 20.0, Some(47900.0));
        assert_eq!(a.time_slice(), 0);
        assert_eq!(a.serial(), 0);
        assert_eq!(a, p.cell_for_pos(10.0, 20.0, Some(47900.0)));

        let b = p.cell_for_pos(10.0, 20.0, Some(48000.0));
        assert_eq!(b.time_slice(), 1);
        assert_ne!(a, b);
        assert_eq!(a.prefix() >> 12, b.prefix() >> 12, "same spatial pixel");
    }

    #[test]
    fn test_decode_inverts_encode() {
        let p = survey();
        for &(ra, dec, t) in &[
            (10.0, 20.0, 47900.0),
            (359.9, -75.0, 50000.0),
            (180.0, 0.0, 47000.0),
            (45.0, 89.0, 60000.5),
        ] {
            let cell = p.cell_for_pos(ra, dec, Some(t));
            let d = p.decode(cell);
            assert_eq!(d.serial, 0);
            assert_eq!(p.cell_for_xy(d.x, d.y, Some(d.t)), cell);
            // Any point of the same pixel re-encodes to the same cell.
            let dx = sky::pix_size(p.level);
            let nudged = p.cell_for_xy(d.x + 0.3 * dx, d.y - 0.3 * dx, Some(d.t + 0.5 * p.dt));
            assert_eq!(nudged, cell);
        }
    }

    #[test]
    fn test_negative_time_clamps_to_first_slice() {
        let p = survey();
        assert_eq!(p.time_slice(Some(10.0)), 0);
        assert_eq!(p.time_slice(Some(1.0e9)), 4095);
        assert_eq!(p.time_slice(None), 0);
    }

    #[test]
    fn test_static_catalog_has_single_slice() {
        let p = Partitioning::new(4, 0.0, 0.0).unwrap();
        assert_eq!(p.time_slice(Some(55555.0)), 0);
        assert_eq!(p.decode(p.cell_for_pos(1.0, 2.0, Some(55555.0))).t, 0.0);
    }

    #[test]
    fn test_serial_survives_decode() {
        let p = survey();
        let cell = p.cell_for_pos(120.0, -30.0, Some(49000.0));
        let row = CellId(cell.raw() | 77);
        let d = p.decode(row);
        assert_eq!(d.serial, 77);
        assert_eq!(p.cell_for_xy(d.x, d.y, Some(d.t)), row.cell());
    }

    #[test]
    fn test_invalid_levels_rejected() {
        assert!(Partitioning::new(0, 0.0, 0.0).is_err());
        assert!(Partitioning::new(10, 0.0, 0.0).is_err());
        assert!(Partitioning::new(9, 0.0, 0.0).is_ok());
    }
}

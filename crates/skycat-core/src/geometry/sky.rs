//! Sky projection and the hierarchical planar pixelization.
//!
//! The sky maps onto the diamond `|x| + |y| <= 1` through a rotated Lambert
//! cylindrical equal-area projection:
//!
//! ```text
//! u = ra / 360            v = (sin(dec) + 1) / 2
//! x = u - v               y = u + v - 1
//! ```
//!
//! The NE edge (`x + y = 1`) and SW edge (`x + y = -1`) are the ra = 0/360
//! seam and are glued by the translation `(x, y) -> (x + 1, y + 1)`. The NW
//! and SE edges are the poles.
//!
//! Level 0 is the root square `[-1, 1]²`; every level halves the pixel edge.

use std::collections::HashSet;

use super::polygon::{EPS, Polygon};

/// Tolerance for "lies on a pixel/diamond edge" tests.
const EDGE_EPS: f64 = 1e-9;

/// The valid sky polygon.
pub fn valid_sky() -> Polygon {
    Polygon::new(vec![(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)])
}

pub(crate) fn dec_to_v(dec: f64) -> f64 {
    (dec.to_radians().sin() + 1.0) * 0.5
}

pub(crate) fn uv_to_xy(u: f64, v: f64) -> (f64, f64) {
    (u - v, u + v - 1.0)
}

/// Project `(ra, dec)` in degrees onto the plane.
pub fn project(ra: f64, dec: f64) -> (f64, f64) {
    let u = ra.rem_euclid(360.0) / 360.0;
    uv_to_xy(u, dec_to_v(dec.clamp(-90.0, 90.0)))
}

/// Inverse of [`project`]: returns `(ra, dec)` in degrees.
pub fn deproject(x: f64, y: f64) -> (f64, f64) {
    let u = (x + y + 1.0) * 0.5;
    let v = (y - x + 1.0) * 0.5;
    let dec = (2.0 * v - 1.0).clamp(-1.0, 1.0).asin().to_degrees();
    (u * 360.0, dec)
}

/// Edge length of a pixel at `level`.
pub fn pix_size(level: u32) -> f64 {
    2.0 / (1u64 << level) as f64
}

fn pixel_index(coord: f64, level: u32) -> i64 {
    let n = 1i64 << level;
    (((coord + 1.0) / pix_size(level)).floor() as i64).clamp(0, n - 1)
}

/// Snap `(x, y)` to the center of the containing pixel at `level`.
pub fn xy_center(x: f64, y: f64, level: u32) -> (f64, f64) {
    let dx = pix_size(level);
    let c = |v: f64| -1.0 + (pixel_index(v, level) as f64 + 0.5) * dx;
    (c(x), c(y))
}

/// Whether the pixel centered on `(cx, cy)` is cut in half by the sky boundary.
pub fn is_half_pixel(cx: f64, cy: f64) -> bool {
    ((cx.abs() + cy.abs()) - 1.0).abs() < EDGE_EPS
}

/// Bounding polygon of a pixel: a square, or a triangle for half-pixels.
pub fn pixel_bounds(cx: f64, cy: f64, dx: f64) -> Polygon {
    let square = Polygon::square(cx, cy, dx);
    if is_half_pixel(cx, cy) {
        square.clip(&valid_sky())
    } else {
        square
    }
}

/// Centers of the four children of the pixel centered on `(cx, cy)` with edge `dx`.
pub fn children(cx: f64, cy: f64, dx: f64) -> [(f64, f64); 4] {
    let q = 0.25 * dx;
    [
        (cx + q, cy + q),
        (cx - q, cy + q),
        (cx - q, cy - q),
        (cx + q, cy - q),
    ]
}

/// Directory path components of the pixel containing `(x, y)` at `level`.
///
/// One component per level `1..=level`: the x-bit then y-bit of the
/// quadrant the pixel occupies within its parent.
pub fn pixel_path(x: f64, y: f64, level: u32) -> Vec<String> {
    let mut parent = xy_center(x, y, 0);
    let mut out = Vec::with_capacity(level as usize);
    for lev in 1..=level {
        let c = xy_center(x, y, lev);
        let xb = u8::from(c.0 > parent.0);
        let yb = u8::from(c.1 > parent.1);
        out.push(format!("{xb}{yb}"));
        parent = c;
    }
    out
}

/// Whether the segment `a → b` lies on the ra seam (NE or SW diamond edge).
pub fn on_seam(a: (f64, f64), b: (f64, f64)) -> bool {
    let on = |p: (f64, f64), s: f64| (p.0 + p.1 - s).abs() < EDGE_EPS;
    (on(a, 1.0) && on(b, 1.0)) || (on(a, -1.0) && on(b, -1.0))
}

/// Centers of the pixels adjacent to `(cx, cy)` at `level`, wrapped across
/// the ra seam. Pixels beyond the poles or outside the sky are dropped.
pub fn neighbors(cx: f64, cy: f64, level: u32, include_self: bool) -> Vec<(f64, f64)> {
    let dx = pix_size(level);
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(9);
    for di in -1i32..=1 {
        for dj in -1i32..=1 {
            if di == 0 && dj == 0 && !include_self {
                continue;
            }
            let (mut nx, mut ny) = (cx + di as f64 * dx, cy + dj as f64 * dx);
            if (nx - ny).abs() > 1.0 + EDGE_EPS {
                continue;
            }
            if nx + ny > 1.0 + EDGE_EPS {
                nx -= 1.0;
                ny -= 1.0;
            } else if nx + ny < -1.0 - EDGE_EPS {
                nx += 1.0;
                ny += 1.0;
            }
            if nx.abs() + ny.abs() > 1.0 + EDGE_EPS {
                continue;
            }
            let key = (pixel_index(nx, level), pixel_index(ny, level));
            let is_self = key == (pixel_index(cx, level), pixel_index(cy, level));
            if is_self && !include_self {
                continue;
            }
            if seen.insert(key) {
                out.push(xy_center(nx, ny, level));
            }
        }
    }
    out
}

/// True if two areas are equal within floating-point tolerance.
pub fn same_area(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPS.max(1e-9 * a.abs().max(b.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_project_roundtrip() {
        for &(ra, dec) in &[(10.0, 20.0), (359.5, -89.0), (180.0, 0.0), (0.0, 45.0)] {
            let (x, y) = project(ra, dec);
            assert!(x.abs() + y.abs() <= 1.0 + 1e-12);
            let (ra2, dec2) = deproject(x, y);
            assert!(approx(ra, ra2) && approx(dec, dec2), "{ra},{dec} -> {ra2},{dec2}");
        }
    }

    #[test]
    fn test_xy_center_levels() {
        assert_eq!(xy_center(0.3, -0.7, 0), (0.0, 0.0));
        assert_eq!(xy_center(0.3, -0.7, 1), (0.5, -0.5));
        assert_eq!(xy_center(0.3, -0.7, 2), (0.25, -0.75));
        assert_eq!(xy_center(1.0, 1.0, 2), (0.75, 0.75), "upper edge clamps");
    }

    #[test]
    fn test_half_pixels_are_triangles() {
        let tri = pixel_bounds(0.5, 0.5, 1.0);
        assert_eq!(tri.n_points(), 3);
        assert!(approx(tri.area(), 0.5));
        let sq = pixel_bounds(0.25, 0.25, 0.5);
        assert_eq!(sq.n_points(), 4);
    }

    #[test]
    fn test_pixel_path() {
        assert!(pixel_path(0.1, 0.1, 0).is_empty());
        assert_eq!(pixel_path(0.3, -0.7, 2), vec!["10".to_string(), "00".to_string()]);
    }

    #[test]
    fn test_interior_pixel_has_eight_neighbors() {
        let (cx, cy) = xy_center(0.01, 0.01, 4);
        let n = neighbors(cx, cy, 4, false);
        assert_eq!(n.len(), 8);
        assert!(!n.contains(&(cx, cy)));
        assert_eq!(neighbors(cx, cy, 4, true).len(), 9);
    }

    #[test]
    fn test_neighbors_wrap_across_seam() {
        // Half-pixel on the NE (ra = 360) edge; its neighbor across the seam
        // sits next to the SW (ra = 0) edge.
        let level = 3;
        let dx = pix_size(level);
        let (cx, cy) = (0.5 + 0.5 * dx, 0.5 - 0.5 * dx);
        assert!(is_half_pixel(cx, cy));
        let n = neighbors(cx, cy, level, false);
        let across = (cx + dx - 1.0, cy - 1.0);
        assert!(
            n.iter().any(|&(x, y)| approx(x, across.0) && approx(y, across.1)),
            "{n:?}"
        );
        for (x, y) in n {
            assert!(x.abs() + y.abs() <= 1.0 + 1e-9);
        }
    }
}

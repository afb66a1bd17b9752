//! Convex polygons and footprints (unions of convex polygons) in the plane.

/// Tolerance used for orientation tests and area comparisons.
pub const EPS: f64 = 1e-12;

type Pt = (f64, f64);

fn cross(o: Pt, a: Pt, b: Pt) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// A convex polygon with counter-clockwise vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Pt>,
}

impl Polygon {
    /// Build a polygon from convex vertices in either orientation.
    pub fn new(mut vertices: Vec<Pt>) -> Self {
        if signed_area(&vertices) < 0.0 {
            vertices.reverse();
        }
        Self { vertices }
    }

    pub fn empty() -> Self {
        Self {
            vertices: Vec::new(),
        }
    }

    /// Axis-aligned rectangle spanning `[x0, x1] × [y0, y1]`.
    pub fn rectangle(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            vertices: vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1)],
        }
    }

    /// Axis-aligned square of edge `size` centered on `(cx, cy)`.
    pub fn square(cx: f64, cy: f64, size: f64) -> Self {
        let h = 0.5 * size;
        Self::rectangle(cx - h, cy - h, cx + h, cy + h)
    }

    pub fn vertices(&self) -> &[Pt] {
        &self.vertices
    }

    pub fn n_points(&self) -> usize {
        self.vertices.len()
    }

    pub fn area(&self) -> f64 {
        signed_area(&self.vertices).abs()
    }

    /// True if the polygon encloses no area.
    pub fn is_empty(&self) -> bool {
        self.vertices.len() < 3 || self.area() <= EPS
    }

    /// Point containment, boundary inclusive.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        if self.is_empty() {
            return false;
        }
        let n = self.vertices.len();
        (0..n).all(|i| cross(self.vertices[i], self.vertices[(i + 1) % n], (x, y)) >= -EPS)
    }

    /// `(xmin, xmax, ymin, ymax)`.
    pub fn bounding_box(&self) -> (f64, f64, f64, f64) {
        self.vertices.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
            |(x0, x1, y0, y1), &(x, y)| (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
        )
    }

    /// Area centroid.
    pub fn centroid(&self) -> Pt {
        let a = signed_area(&self.vertices);
        if a.abs() <= EPS {
            let n = self.vertices.len().max(1) as f64;
            let (sx, sy) = self
                .vertices
                .iter()
                .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x, sy + y));
            return (sx / n, sy / n);
        }
        let n = self.vertices.len();
        let (mut cx, mut cy) = (0.0, 0.0);
        for i in 0..n {
            let (x0, y0) = self.vertices[i];
            let (x1, y1) = self.vertices[(i + 1) % n];
            let f = x0 * y1 - x1 * y0;
            cx += (x0 + x1) * f;
            cy += (y0 + y1) * f;
        }
        (cx / (6.0 * a), cy / (6.0 * a))
    }

    /// Iterate over the directed edges `(start, end)`.
    pub fn edges(&self) -> impl Iterator<Item = (Pt, Pt)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// Keep the part of this polygon left of the directed line `a → b`.
    pub fn clip_half_plane(&self, a: Pt, b: Pt) -> Polygon {
        let n = self.vertices.len();
        if n == 0 {
            return Polygon::empty();
        }
        let inside = |p: Pt| cross(a, b, p) >= -EPS;
        let mut out = Vec::with_capacity(n + 1);
        for i in 0..n {
            let s = self.vertices[(i + n - 1) % n];
            let e = self.vertices[i];
            match (inside(s), inside(e)) {
                (true, true) => out.push(e),
                (true, false) => out.push(intersect(s, e, a, b)),
                (false, true) => {
                    out.push(intersect(s, e, a, b));
                    out.push(e);
                }
                (false, false) => {}
            }
        }
        out.dedup_by(|p, q| (p.0 - q.0).abs() <= EPS && (p.1 - q.1).abs() <= EPS);
        if out.len() > 1 {
            let (first, last) = (out[0], out[out.len() - 1]);
            if (first.0 - last.0).abs() <= EPS && (first.1 - last.1).abs() <= EPS {
                out.pop();
            }
        }
        Polygon { vertices: out }
    }

    /// Intersect with another convex polygon (Sutherland–Hodgman).
    pub fn clip(&self, clipper: &Polygon) -> Polygon {
        let mut result = self.clone();
        for (a, b) in clipper.edges() {
            if result.vertices.is_empty() {
                break;
            }
            result = result.clip_half_plane(a, b);
        }
        result
    }

    /// Move every edge selected by `select(index, start, end)` inward by
    /// `margin` and return the remaining interior.
    pub fn inset_edges<F>(&self, margin: f64, mut select: F) -> Polygon
    where
        F: FnMut(usize, Pt, Pt) -> bool,
    {
        let mut result = self.clone();
        for (i, (a, b)) in self.edges().enumerate() {
            if !select(i, a, b) {
                continue;
            }
            let (dx, dy) = (b.0 - a.0, b.1 - a.1);
            let len = (dx * dx + dy * dy).sqrt();
            if len <= EPS {
                continue;
            }
            // Left normal points inward for counter-clockwise polygons.
            let (nx, ny) = (-dy / len * margin, dx / len * margin);
            result = result.clip_half_plane((a.0 + nx, a.1 + ny), (b.0 + nx, b.1 + ny));
        }
        result
    }
}

fn signed_area(v: &[Pt]) -> f64 {
    let n = v.len();
    if n < 3 {
        return 0.0;
    }
    let mut s = 0.0;
    for i in 0..n {
        let (x0, y0) = v[i];
        let (x1, y1) = v[(i + 1) % n];
        s += x0 * y1 - x1 * y0;
    }
    0.5 * s
}

fn intersect(s: Pt, e: Pt, a: Pt, b: Pt) -> Pt {
    let ab = (b.0 - a.0, b.1 - a.1);
    let d = (e.0 - s.0, e.1 - s.1);
    let denom = ab.0 * d.1 - ab.1 * d.0;
    if denom.abs() <= f64::MIN_POSITIVE {
        return e;
    }
    let t = (ab.0 * (a.1 - s.1) - ab.1 * (a.0 - s.0)) / denom;
    (s.0 + t * d.0, s.1 + t * d.1)
}

/// A sky region: a union of non-overlapping convex polygons.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Footprint {
    parts: Vec<Polygon>,
}

impl Footprint {
    pub fn from_polygon(polygon: Polygon) -> Self {
        Self::from_polygons(vec![polygon])
    }

    /// Build from non-overlapping convex parts; empty parts are dropped.
    pub fn from_polygons(parts: Vec<Polygon>) -> Self {
        Self {
            parts: parts.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }

    /// The whole valid sky.
    pub fn all_sky() -> Self {
        Self::from_polygon(super::sky::valid_sky())
    }

    /// The region `ra ∈ [ra_min, ra_max]`, `dec ∈ [dec_min, dec_max]` (degrees).
    ///
    /// `ra_min > ra_max` wraps through ra = 0.
    pub fn from_radec_box(ra_min: f64, ra_max: f64, dec_min: f64, dec_max: f64) -> Self {
        let (v0, v1) = (
            super::sky::dec_to_v(dec_min.min(dec_max)),
            super::sky::dec_to_v(dec_min.max(dec_max)),
        );
        let uv_box = |u0: f64, u1: f64| {
            let corners = [(u0, v0), (u1, v0), (u1, v1), (u0, v1)];
            Polygon::new(
                corners
                    .iter()
                    .map(|&(u, v)| super::sky::uv_to_xy(u, v))
                    .collect(),
            )
        };
        let (lo, hi) = (ra_min.clamp(0.0, 360.0), ra_max.clamp(0.0, 360.0));
        if lo <= hi {
            Self::from_polygon(uv_box(lo / 360.0, hi / 360.0))
        } else {
            Self::from_polygons(vec![uv_box(lo / 360.0, 1.0), uv_box(0.0, hi / 360.0)])
        }
    }

    pub fn parts(&self) -> &[Polygon] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn area(&self) -> f64 {
        self.parts.iter().map(Polygon::area).sum()
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.parts.iter().any(|p| p.contains(x, y))
    }

    /// Intersect every part with a convex polygon.
    pub fn intersect_polygon(&self, polygon: &Polygon) -> Footprint {
        Footprint::from_polygons(self.parts.iter().map(|p| p.clip(polygon)).collect())
    }

    /// Intersect two footprints.
    pub fn intersect(&self, other: &Footprint) -> Footprint {
        let mut parts = Vec::new();
        for b in &other.parts {
            parts.extend(self.parts.iter().map(|a| a.clip(b)));
        }
        Footprint::from_polygons(parts)
    }
}

impl From<Polygon> for Footprint {
    fn from(polygon: Polygon) -> Self {
        Footprint::from_polygon(polygon)
    }
}

//! Scattered-data interpolation on a Delaunay triangulation.
//!
//! Each triangle carries a cubic Bezier patch built from the vertex values and vertex gradients.
//! Gradients are estimated by a distance-weighted least-squares fit over the neighbouring
//! vertices, so the interpolant is exact for linear data and continuous across edges. Points
//! outside the convex hull of the samples have no value.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

const BARYCENTRIC_TOLERANCE: f64 = 1e-9;

fn orientation(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// `true` if `d` lies strictly inside the circumcircle of the counter-clockwise triangle `abc`.
fn in_circumcircle(a: [f64; 2], b: [f64; 2], c: [f64; 2], d: [f64; 2]) -> bool {
    let (adx, ady) = (a[0] - d[0], a[1] - d[1]);
    let (bdx, bdy) = (b[0] - d[0], b[1] - d[1]);
    let (cdx, cdy) = (c[0] - d[0], c[1] - d[1]);
    let ad = adx * adx + ady * ady;
    let bd = bdx * bdx + bdy * bdy;
    let cd = cdx * cdx + cdy * cdy;
    let det = ad * (bdx * cdy - bdy * cdx) - bd * (adx * cdy - ady * cdx)
        + cd * (adx * bdy - ady * bdx);
    det > 0.0
}

fn ccw(t: [usize; 3], points: &[[f64; 2]]) -> [usize; 3] {
    if orientation(points[t[0]], points[t[1]], points[t[2]]) > 0.0 {
        t
    } else {
        [t[1], t[0], t[2]]
    }
}

/// Directed edges that belong to a single triangle, oriented with the triangle on their left.
fn hull_edges(triangles: &[[usize; 3]]) -> Vec<[usize; 2]> {
    let edges: BTreeSet<[usize; 2]> = triangles
        .iter()
        .flat_map(|t| [[t[0], t[1]], [t[1], t[2]], [t[2], t[0]]])
        .collect();
    edges
        .iter()
        .filter(|[u, v]| !edges.contains(&[*v, *u]))
        .copied()
        .collect()
}

/// Flips edges whose opposite vertex lies inside the neighbouring circumcircle until none is left.
fn legalize(triangles: &mut [[usize; 3]], points: &[[f64; 2]]) {
    let max_flips = triangles.len() * triangles.len() + 16;
    for _ in 0..max_flips {
        let owners: BTreeMap<[usize; 2], usize> = triangles
            .iter()
            .enumerate()
            .flat_map(|(k, t)| [([t[0], t[1]], k), ([t[1], t[2]], k), ([t[2], t[0]], k)])
            .collect();
        let flip = owners.iter().find_map(|(&[a, b], &k)| {
            let &other = owners.get(&[b, a])?;
            let c = opposite(triangles[k], a, b);
            let d = opposite(triangles[other], b, a);
            in_circumcircle(points[a], points[b], points[c], points[d]).then_some((k, other, a, b, c, d))
        });
        let Some((k, other, a, b, c, d)) = flip else {
            return;
        };
        triangles[k] = [a, d, c];
        triangles[other] = [d, b, c];
    }
    log::warn!("triangulation did not settle after {max_flips} flips");
}

fn opposite(t: [usize; 3], a: usize, b: usize) -> usize {
    t.into_iter().find(|&v| v != a && v != b).unwrap_or(a)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Triangulation {
    points: Vec<[f64; 2]>,
    triangles: Vec<[usize; 3]>,
}

impl Triangulation {
    /// Delaunay triangulation covering the whole convex hull. Points must be distinct. Fewer than
    /// three points, or points that are all collinear, give an empty triangulation.
    ///
    /// Points are inserted in lexicographic order, so each new point lies outside the current hull
    /// and is joined to every hull edge it sees. Lawson flips then make the result Delaunay.
    pub fn delaunay(points: &[[f64; 2]]) -> Self {
        let empty = Triangulation {
            points: points.to_vec(),
            triangles: vec![],
        };
        if points.len() < 3 || points.iter().flatten().any(|v| !v.is_finite()) {
            return empty;
        }

        let mut order: Vec<usize> = (0..points.len()).collect();
        order.sort_by(|&a, &b| points[a].partial_cmp(&points[b]).unwrap_or(Ordering::Equal));

        // the first point off the line through the first two seeds the fan
        let Some(apex) = (2..order.len()).find(|&k| {
            orientation(points[order[0]], points[order[1]], points[order[k]]) != 0.0
        }) else {
            return empty;
        };
        let p = order[apex];
        let mut triangles: Vec<[usize; 3]> = order[..apex]
            .windows(2)
            .map(|w| ccw([w[0], w[1], p], points))
            .collect();

        for &i in &order[apex + 1..] {
            let visible: Vec<[usize; 2]> = hull_edges(&triangles)
                .into_iter()
                .filter(|&[u, v]| orientation(points[u], points[v], points[i]) < 0.0)
                .collect();
            triangles.extend(visible.into_iter().map(|[u, v]| [v, u, i]));
        }

        legalize(&mut triangles, points);
        triangles.sort_unstable();
        Triangulation {
            points: points.to_vec(),
            triangles,
        }
    }

    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    pub fn triangles(&self) -> &[[usize; 3]] {
        &self.triangles
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// For every vertex, the vertices it shares an edge with.
    pub fn neighbours(&self) -> Vec<BTreeSet<usize>> {
        let mut neighbours = vec![BTreeSet::new(); self.points.len()];
        for t in &self.triangles {
            for k in 0..3 {
                neighbours[t[k]].insert(t[(k + 1) % 3]);
                neighbours[t[k]].insert(t[(k + 2) % 3]);
            }
        }
        neighbours
    }

    /// Triangle containing `p` and the barycentric coordinates of `p` in it.
    pub fn locate(&self, p: [f64; 2]) -> Option<(usize, [f64; 3])> {
        self.triangles.iter().enumerate().find_map(|(index, t)| {
            let [a, b, c] = [self.points[t[0]], self.points[t[1]], self.points[t[2]]];
            let det = (b[1] - c[1]) * (a[0] - c[0]) + (c[0] - b[0]) * (a[1] - c[1]);
            let l1 = ((b[1] - c[1]) * (p[0] - c[0]) + (c[0] - b[0]) * (p[1] - c[1])) / det;
            let l2 = ((c[1] - a[1]) * (p[0] - c[0]) + (a[0] - c[0]) * (p[1] - c[1])) / det;
            let l3 = 1.0 - l1 - l2;
            (l1 >= -BARYCENTRIC_TOLERANCE
                && l2 >= -BARYCENTRIC_TOLERANCE
                && l3 >= -BARYCENTRIC_TOLERANCE)
                .then_some((index, [l1, l2, l3]))
        })
    }
}

/// Piecewise cubic interpolant over a [`Triangulation`].
#[derive(Debug, Clone, PartialEq)]
pub struct CubicTriangleInterpolator {
    triangulation: Triangulation,
    values: Vec<f64>,
    gradients: Vec<[f64; 2]>,
}

impl CubicTriangleInterpolator {
    /// `points` must be distinct and `values` must have one entry per point.
    pub fn new(points: &[[f64; 2]], values: &[f64]) -> Self {
        let triangulation = Triangulation::delaunay(points);
        let gradients = estimate_gradients(&triangulation, values);
        CubicTriangleInterpolator {
            triangulation,
            values: values.to_vec(),
            gradients,
        }
    }

    pub fn triangulation(&self) -> &Triangulation {
        &self.triangulation
    }

    /// Interpolated value at `(x, y)`, or `None` outside the convex hull.
    pub fn evaluate(&self, x: f64, y: f64) -> Option<f64> {
        let (index, [l1, l2, l3]) = self.triangulation.locate([x, y])?;
        let [i, j, k] = self.triangulation.triangles[index];
        let p = &self.triangulation.points;
        let (f1, f2, f3) = (self.values[i], self.values[j], self.values[k]);
        let edge = |from: usize, to: usize| {
            let g = self.gradients[from];
            self.values[from]
                + (g[0] * (p[to][0] - p[from][0]) + g[1] * (p[to][1] - p[from][1])) / 3.0
        };

        let c210 = edge(i, j);
        let c201 = edge(i, k);
        let c120 = edge(j, i);
        let c021 = edge(j, k);
        let c102 = edge(k, i);
        let c012 = edge(k, j);
        let e = (c210 + c201 + c120 + c021 + c102 + c012) / 6.0;
        let v = (f1 + f2 + f3) / 3.0;
        let c111 = e + (e - v) / 2.0;

        Some(
            f1 * l1.powi(3)
                + f2 * l2.powi(3)
                + f3 * l3.powi(3)
                + 3.0 * c210 * l1 * l1 * l2
                + 3.0 * c201 * l1 * l1 * l3
                + 3.0 * c120 * l1 * l2 * l2
                + 3.0 * c021 * l2 * l2 * l3
                + 3.0 * c102 * l1 * l3 * l3
                + 3.0 * c012 * l2 * l3 * l3
                + 6.0 * c111 * l1 * l2 * l3,
        )
    }
}

/// Weighted least-squares plane through each vertex and its neighbours.
fn estimate_gradients(triangulation: &Triangulation, values: &[f64]) -> Vec<[f64; 2]> {
    let points = triangulation.points();
    triangulation
        .neighbours()
        .iter()
        .enumerate()
        .map(|(i, neighbours)| {
            let (mut sxx, mut sxy, mut syy, mut sxf, mut syf) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for &j in neighbours {
                let dx = points[j][0] - points[i][0];
                let dy = points[j][1] - points[i][1];
                let df = values[j] - values[i];
                let w = 1.0 / (dx * dx + dy * dy);
                sxx += w * dx * dx;
                sxy += w * dx * dy;
                syy += w * dy * dy;
                sxf += w * dx * df;
                syf += w * dy * df;
            }
            let det = sxx * syy - sxy * sxy;
            if det.abs() < 1e-12 {
                [0.0, 0.0]
            } else {
                [(syy * sxf - sxy * syf) / det, (sxx * syf - sxy * sxf) / det]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plane(p: [f64; 2]) -> f64 {
        2.0 * p[0] - 3.0 * p[1] + 1.0
    }

    #[test]
    fn test_square_gives_two_triangles() {
        let points = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0], [10.0, 10.0]];
        let triangulation = Triangulation::delaunay(&points);
        assert_eq!(triangulation.triangles().len(), 2);
    }

    #[test]
    fn test_collinear_points_have_no_triangles() {
        let points = [[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        assert!(Triangulation::delaunay(&points).is_empty());
    }

    #[test]
    fn test_triangulation_is_delaunay() {
        let points = [
            [0.0, 0.0],
            [7.0, 1.0],
            [3.0, 6.0],
            [9.0, 8.0],
            [1.0, 9.0],
            [5.0, 3.0],
        ];
        let triangulation = Triangulation::delaunay(&points);
        assert!(!triangulation.is_empty());
        for t in triangulation.triangles() {
            let [a, b, c] = [points[t[0]], points[t[1]], points[t[2]]];
            assert!(orientation(a, b, c) > 0.0);
            for (i, &p) in points.iter().enumerate() {
                if !t.contains(&i) {
                    assert!(!in_circumcircle(a, b, c, p));
                }
            }
        }
    }

    #[test]
    fn test_linear_data_is_reproduced() {
        let points = [
            [0.0, 0.0],
            [7.0, 1.0],
            [3.0, 6.0],
            [9.0, 8.0],
            [1.0, 9.0],
            [5.0, 3.0],
        ];
        let values: Vec<f64> = points.iter().map(|&p| plane(p)).collect();
        let interpolator = CubicTriangleInterpolator::new(&points, &values);
        for p in [[4.0, 4.0], [5.0, 3.0], [2.5, 5.0], [6.0, 6.5]] {
            assert_relative_eq!(interpolator.evaluate(p[0], p[1]).unwrap(), plane(p), epsilon = 1e-9);
        }
    }

    fn area(points: &[[f64; 2]], t: &[usize; 3]) -> f64 {
        orientation(points[t[0]], points[t[1]], points[t[2]]) / 2.0
    }

    fn hull_area(points: &[[f64; 2]]) -> f64 {
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut hull: Vec<[f64; 2]> = Vec::new();
        for pass in [sorted.clone(), sorted.into_iter().rev().collect()] {
            let start = hull.len();
            for p in pass {
                while hull.len() >= start + 2
                    && orientation(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
                {
                    hull.pop();
                }
                hull.push(p);
            }
            hull.pop();
        }
        (0..hull.len())
            .map(|k| {
                let (a, b) = (hull[k], hull[(k + 1) % hull.len()]);
                a[0] * b[1] - b[0] * a[1]
            })
            .sum::<f64>()
            / 2.0
    }

    /// Deterministic scattered integer points.
    fn scattered(seed: u64, count: usize, span: u64) -> Vec<[f64; 2]> {
        let mut state = seed;
        let mut next = || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) % span) as f64
        };
        let mut points: Vec<[f64; 2]> = Vec::new();
        while points.len() < count {
            let p = [next(), next()];
            if !points.contains(&p) {
                points.push(p);
            }
        }
        points
    }

    #[test]
    fn test_triangles_cover_the_convex_hull() {
        for seed in 0..200 {
            let count = 4 + (seed as usize % 20);
            let points = scattered(seed, count, 1000);
            let triangulation = Triangulation::delaunay(&points);
            let covered: f64 = triangulation.triangles().iter().map(|t| area(&points, t)).sum();
            assert!(triangulation.triangles().iter().all(|t| area(&points, t) > 0.0));
            assert_relative_eq!(covered, hull_area(&points), max_relative = 1e-9);
        }
    }

    #[test]
    fn test_collinear_start_is_fanned() {
        let points = [[0.0, 0.0], [0.0, 5.0], [0.0, 10.0], [8.0, 3.0], [9.0, 12.0]];
        let triangulation = Triangulation::delaunay(&points);
        let covered: f64 = triangulation.triangles().iter().map(|t| area(&points, t)).sum();
        assert_relative_eq!(covered, hull_area(&points), epsilon = 1e-9);
    }

    #[test]
    fn test_outside_hull_is_none() {
        let points = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];
        let interpolator = CubicTriangleInterpolator::new(&points, &[1.0, 2.0, 3.0]);
        assert!(interpolator.evaluate(9.0, 9.0).is_none());
        assert_relative_eq!(interpolator.evaluate(10.0, 0.0).unwrap(), 2.0, epsilon = 1e-12);
    }
}

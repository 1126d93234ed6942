//! Turns the sparse map of scanned locations into a regular grid for display.
//!
//! With few points a coarse fixed grid just shows each location in its cell. From
//! [`MIN_INTERPOLATION_POINTS`] on, the grid adapts its resolution to the extent of the data and is
//! filled by cubic interpolation over a Delaunay triangulation; cells outside the convex hull of
//! the scanned locations stay masked.

use crate::interpolation::CubicTriangleInterpolator;
use ndarray::{Array2, Zip};
use std::collections::BTreeMap;

pub const MIN_INTERPOLATION_POINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridMode {
    Coarse,
    Interpolated,
}

/// Text label placed at a scanned location.
#[derive(Debug, Clone, PartialEq)]
pub struct PointAnnotation {
    /// Display coordinate, y pointing up.
    pub position: [i64; 2],
    pub value: f64,
}

/// Coordinate mesh and values. Row `i` of every array holds the cells at `y[[i, 0]]`, increasing
/// with `i`; masked cells are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatMapGrid {
    pub mode: GridMode,
    pub resolution: i64,
    pub x: Array2<f64>,
    pub y: Array2<f64>,
    pub values: Array2<Option<f64>>,
    pub annotations: Vec<PointAnnotation>,
    pub title: String,
}

impl HeatMapGrid {
    pub fn valid_cells(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Smallest and largest unmasked value.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values.iter().flatten().fold(None, |range, &v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatMapRenderer {
    pub coarse_resolution: i64,
    pub coarse_extent: i64,
    /// Number of cells the data range is divided into when choosing the resolution.
    pub resolution_divisor: i64,
    pub max_resolution: i64,
}

impl Default for HeatMapRenderer {
    fn default() -> Self {
        HeatMapRenderer {
            coarse_resolution: 25,
            coarse_extent: 600,
            resolution_divisor: 50,
            max_resolution: 50,
        }
    }
}

pub fn title(depth: Option<f64>) -> String {
    match depth {
        None => "Average Brillouin Shift Frequency Map (GHz)".to_string(),
        Some(depth) => format!("Brillouin Shift Frequency Map at {depth} (GHz)"),
    }
}

/// Inclusive axis from `low` to `high` in steps of `resolution`.
fn axis(low: i64, high: i64, resolution: i64) -> Vec<i64> {
    (low..=high).step_by(resolution as usize).collect()
}

fn mesh(x_axis: &[i64], y_axis: &[i64]) -> (Array2<f64>, Array2<f64>) {
    let shape = (y_axis.len(), x_axis.len());
    (
        Array2::from_shape_fn(shape, |(_, j)| x_axis[j] as f64),
        Array2::from_shape_fn(shape, |(i, _)| y_axis[i] as f64),
    )
}

impl HeatMapRenderer {
    /// Builds the grid for `points`, which maps relative coordinates (image y-axis pointing down)
    /// to shifts. Calling this twice with the same input gives the same grid.
    pub fn plot(&self, points: &BTreeMap<[i64; 2], f64>, depth: Option<f64>) -> HeatMapGrid {
        let annotations = points
            .iter()
            .map(|(&[x, y], &value)| PointAnnotation {
                position: [x, -y],
                value,
            })
            .collect();
        let mut grid = if points.len() < MIN_INTERPOLATION_POINTS {
            self.coarse(points)
        } else {
            self.interpolated(points)
        };
        grid.annotations = annotations;
        grid.title = title(depth);
        log::debug!(
            "heat map: {} points, {:?} grid {:?} at resolution {}, {} valid cells",
            points.len(),
            grid.mode,
            grid.values.dim(),
            grid.resolution,
            grid.valid_cells()
        );
        grid
    }

    /// Resolution for data spanning `data_range` pixels.
    pub fn resolution_for(&self, data_range: i64) -> i64 {
        let cells = data_range.div_euclid(self.resolution_divisor);
        if cells <= 1 {
            1
        } else {
            cells.min(self.max_resolution)
        }
    }

    fn coarse(&self, points: &BTreeMap<[i64; 2], f64>) -> HeatMapGrid {
        let resolution = self.coarse_resolution;
        let extent = self.coarse_extent;
        let axis = axis(-extent, extent, resolution);
        let (x, y) = mesh(&axis, &axis);
        let mut values = Array2::from_elem(x.dim(), None);
        let center = extent.div_euclid(resolution);
        for (&[px, py], &value) in points {
            let row = (-py).div_euclid(resolution) + center;
            let col = px.div_euclid(resolution) + center;
            match (usize::try_from(row), usize::try_from(col)) {
                (Ok(row), Ok(col)) if row < axis.len() && col < axis.len() => {
                    values[[row, col]] = Some(value);
                }
                _ => log::warn!("location ({px}, {py}) lies outside the coarse map"),
            }
        }
        HeatMapGrid {
            mode: GridMode::Coarse,
            resolution,
            x,
            y,
            values,
            annotations: vec![],
            title: String::new(),
        }
    }

    fn interpolated(&self, points: &BTreeMap<[i64; 2], f64>) -> HeatMapGrid {
        let display: Vec<([i64; 2], f64)> = points.iter().map(|(&[x, y], &v)| ([x, -y], v)).collect();
        let (mut min_x, mut max_x) = (i64::MAX, i64::MIN);
        let (mut min_y, mut max_y) = (i64::MAX, i64::MIN);
        for ([x, y], _) in &display {
            min_x = min_x.min(*x);
            max_x = max_x.max(*x);
            min_y = min_y.min(*y);
            max_y = max_y.max(*y);
        }
        let resolution = self.resolution_for((max_x - min_x).max(max_y - min_y));

        // pad the narrower axis on both sides so the grid is square
        let difference = (max_x - min_x) - (max_y - min_y);
        let pad = (difference.abs() + 1) / 2;
        if difference > 0 {
            min_y -= pad;
            max_y += pad;
        } else if difference < 0 {
            min_x -= pad;
            max_x += pad;
        }
        let snap = |v: i64| v.div_euclid(resolution) * resolution;
        let mut x_axis = axis(snap(min_x), snap(max_x), resolution);
        let mut y_axis = axis(snap(min_y), snap(max_y), resolution);
        while x_axis.len() < y_axis.len() {
            x_axis.push(x_axis[x_axis.len() - 1] + resolution);
        }
        while y_axis.len() < x_axis.len() {
            y_axis.push(y_axis[y_axis.len() - 1] + resolution);
        }
        let (x, y) = mesh(&x_axis, &y_axis);

        // locations that snap onto the same node are averaged
        let mut snapped: BTreeMap<[i64; 2], (f64, usize)> = BTreeMap::new();
        for ([px, py], value) in &display {
            let entry = snapped.entry([snap(*px), snap(*py)]).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        let nodes: Vec<[f64; 2]> = snapped.keys().map(|&[a, b]| [a as f64, b as f64]).collect();
        let node_values: Vec<f64> = snapped.values().map(|(sum, n)| sum / *n as f64).collect();
        let interpolator = CubicTriangleInterpolator::new(&nodes, &node_values);
        if interpolator.triangulation().is_empty() {
            log::warn!(
                "{} snapped locations do not span an area, nothing to interpolate",
                nodes.len()
            );
        } else {
            log::debug!(
                "{} nodes, {} triangles",
                nodes.len(),
                interpolator.triangulation().triangles().len()
            );
        }

        let mut values = Array2::from_elem(x.dim(), None);
        Zip::from(&mut values)
            .and(&x)
            .and(&y)
            .par_for_each(|value, &cx, &cy| *value = interpolator.evaluate(cx, cy));

        HeatMapGrid {
            mode: GridMode::Interpolated,
            resolution,
            x,
            y,
            values,
            annotations: vec![],
            title: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn points(entries: &[([i64; 2], f64)]) -> BTreeMap<[i64; 2], f64> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_three_points_use_coarse_grid() {
        let map = points(&[([0, 0], 5.0), ([100, 50], 5.2), ([-200, -300], 5.4)]);
        let grid = HeatMapRenderer::default().plot(&map, None);
        assert_eq!(grid.mode, GridMode::Coarse);
        assert_eq!(grid.resolution, 25);
        assert_eq!(grid.values.dim(), (49, 49));
        assert_eq!(grid.valid_cells(), 3);
        assert_eq!(grid.values[[24, 24]], Some(5.0));
        // y = 50 is drawn 2 cells below the center
        assert_eq!(grid.values[[22, 28]], Some(5.2));
        assert_eq!(grid.values[[36, 16]], Some(5.4));
        assert_relative_eq!(grid.x[[0, 0]], -600.0);
        assert_relative_eq!(grid.y[[48, 0]], 600.0);
    }

    #[test]
    fn test_coarse_grid_skips_far_points() {
        let map = points(&[([5000, 0], 5.0)]);
        let grid = HeatMapRenderer::default().plot(&map, None);
        assert_eq!(grid.valid_cells(), 0);
        assert_eq!(grid.annotations.len(), 1);
    }

    #[test]
    fn test_four_points_are_interpolated() {
        let map = points(&[
            ([0, 0], 5.0),
            ([100, 0], 5.2),
            ([0, 100], 5.4),
            ([100, 100], 5.6),
        ]);
        let grid = HeatMapRenderer::default().plot(&map, None);
        assert_eq!(grid.mode, GridMode::Interpolated);
        assert_eq!(grid.resolution, 2);
        assert_eq!(grid.values.dim(), (51, 51));
        // the data is linear, so every cell inside the square is exact
        assert_eq!(grid.valid_cells(), 51 * 51);
        for ((value, &x), &y) in grid.values.iter().zip(grid.x.iter()).zip(grid.y.iter()) {
            let expected = 5.0 + 0.002 * x - 0.004 * y;
            assert_relative_eq!(value.unwrap(), expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_plot_is_idempotent() {
        let map = points(&[
            ([0, 0], 5.0),
            ([120, 30], 5.3),
            ([40, 160], 4.9),
            ([-70, 90], 5.1),
            ([60, -80], 5.5),
        ]);
        let renderer = HeatMapRenderer::default();
        assert_eq!(renderer.plot(&map, Some(12.5)), renderer.plot(&map, Some(12.5)));
    }

    #[test]
    fn test_cells_outside_the_hull_are_masked() {
        let map = points(&[([0, 0], 5.0), ([200, 0], 5.2), ([0, -200], 5.4), ([50, -50], 5.1)]);
        let grid = HeatMapRenderer::default().plot(&map, None);
        let (rows, cols) = grid.values.dim();
        assert_eq!(rows, cols);
        // display points form the triangle (0,0), (200,0), (0,200); its far corner is empty
        assert_eq!(grid.values[[rows - 1, cols - 1]], None);
        assert!(grid.values[[0, 0]].is_some());
        assert!(grid.valid_cells() < rows * cols);
    }

    fn convex_hull(mut nodes: Vec<[f64; 2]>) -> Vec<[f64; 2]> {
        let cross = |o: [f64; 2], a: [f64; 2], b: [f64; 2]| {
            (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
        };
        nodes.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut hull: Vec<[f64; 2]> = Vec::new();
        for pass in [nodes.clone(), nodes.into_iter().rev().collect()] {
            let start = hull.len();
            for p in pass {
                while hull.len() >= start + 2
                    && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
                {
                    hull.pop();
                }
                hull.push(p);
            }
            hull.pop();
        }
        hull
    }

    #[test]
    fn test_cells_inside_the_hull_have_values() {
        let map = points(&[
            ([-23, -417], 5.0),
            ([247, -500], 5.3),
            ([-13, -9], 4.8),
            ([-433, 371], 5.6),
            ([310, 120], 5.1),
            ([-260, -180], 4.9),
            ([90, 433], 5.4),
            ([480, -60], 5.2),
        ]);
        let grid = HeatMapRenderer::default().plot(&map, None);
        let r = grid.resolution;
        let nodes: Vec<[f64; 2]> = map
            .keys()
            .map(|&[x, y]| {
                [
                    (x.div_euclid(r) * r) as f64,
                    ((-y).div_euclid(r) * r) as f64,
                ]
            })
            .collect();
        let hull = convex_hull(nodes);
        let mut masked_inside = 0;
        for ((value, &cx), &cy) in grid.values.iter().zip(grid.x.iter()).zip(grid.y.iter()) {
            let inside = (0..hull.len()).all(|k| {
                let (a, b) = (hull[k], hull[(k + 1) % hull.len()]);
                let length = ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt();
                let cross = (b[0] - a[0]) * (cy - a[1]) - (b[1] - a[1]) * (cx - a[0]);
                cross > length
            });
            if inside && value.is_none() {
                masked_inside += 1;
            }
        }
        assert_eq!(masked_inside, 0);
    }

    #[test]
    fn test_resolution_adapts_to_extent() {
        let renderer = HeatMapRenderer::default();
        assert_eq!(renderer.resolution_for(40), 1);
        assert_eq!(renderer.resolution_for(99), 1);
        assert_eq!(renderer.resolution_for(1000), 20);
        assert_eq!(renderer.resolution_for(5000), 50);
    }

    #[test]
    fn test_narrow_data_gives_square_grid() {
        let map = points(&[([0, 0], 5.0), ([300, 0], 5.2), ([0, 40], 5.4), ([300, 40], 5.6)]);
        let grid = HeatMapRenderer::default().plot(&map, None);
        let (rows, cols) = grid.values.dim();
        assert_eq!(rows, cols);
        assert_eq!(grid.x.row(0).len(), cols);
    }

    #[test]
    fn test_title_depends_on_depth() {
        assert_eq!(title(None), "Average Brillouin Shift Frequency Map (GHz)");
        assert!(title(Some(3.0)).contains("at 3"));
    }
}

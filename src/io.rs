//! Writing scan results and heat maps to disk.

use crate::error::ExportError;
use crate::heatmap::HeatMapGrid;
use crate::scan::ScanOutcome;
use chrono::Local;
use image::{GrayImage, RgbImage};
use ndarray::{Array1, Array3};
use ndarray_npy::NpzWriter;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::register_font;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Fresh directory for one scan below `base`, named after the local time and start position.
pub fn scan_export_dir(base: &Path, start_position: i64) -> PathBuf {
    base.join(format!(
        "scan_{}_{}",
        Local::now().format("%Y%m%d_%H%M%S%.3f"),
        start_position
    ))
}

/// Writes the strips of a scan as `frame_000.png`, `frame_001.png`, ... in visitation order.
pub fn export_image_stack(dir: &Path, images: &[GrayImage]) -> Result<Vec<PathBuf>, ExportError> {
    fs::create_dir_all(dir)?;
    images
        .iter()
        .enumerate()
        .map(|(i, img)| {
            let path = dir.join(format!("frame_{i:03}.png"));
            img.save(&path)?;
            Ok(path)
        })
        .collect()
}

/// Stacks equally sized strips into an `(n, height, width)` array.
fn stack_images(images: &[GrayImage]) -> Result<Array3<u8>, ExportError> {
    let first = images.first().ok_or(ExportError::Empty)?;
    let (width, height) = first.dimensions();
    let mut stack = Array3::<u8>::zeros((images.len(), height as usize, width as usize));
    for (index, img) in images.iter().enumerate() {
        if img.dimensions() != (width, height) {
            return Err(ExportError::InconsistentImage {
                index,
                width: img.width(),
                height: img.height(),
                expected_width: width,
                expected_height: height,
            });
        }
        for (x, y, pixel) in img.enumerate_pixels() {
            stack[[index, y as usize, x as usize]] = pixel.0[0];
        }
    }
    Ok(stack)
}

/// Saves positions, shifts and the strip stack of a scan as an `.npz` archive.
pub fn save_scan_npz(path: &Path, outcome: &ScanOutcome) -> Result<(), ExportError> {
    let positions: Array1<i64> = outcome.shift_profile.iter().map(|(p, _)| *p).collect();
    let shifts: Array1<f64> = outcome.shift_profile.iter().map(|(_, s)| *s).collect();
    let images = stack_images(&outcome.image_stack)?;

    let mut npz = NpzWriter::new(File::create(path)?);
    npz.add_array("positions", &positions)?;
    npz.add_array("shifts", &shifts)?;
    npz.add_array("images", &images)?;
    npz.finish()?;
    Ok(())
}

/// Exports a finished scan into `dir`: one PNG per position plus `scan.npz`.
pub fn export_scan(dir: &Path, outcome: &ScanOutcome) -> Result<(), ExportError> {
    let frames = export_image_stack(dir, &outcome.image_stack)?;
    save_scan_npz(&dir.join("scan.npz"), outcome)?;
    log::info!("exported {} frames to {}", frames.len(), dir.display());
    Ok(())
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> RGBColor {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    let (r, g, b) = match (i as i32).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    RGBColor((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
}

/// Blue for the smallest value, red for the largest.
pub fn color_from_value(value: f64, min: f64, max: f64) -> RGBColor {
    let span = max - min;
    let normalized = if span > 0.0 {
        ((value - min) / span).clamp(0.0, 1.0)
    } else {
        0.5
    };
    hsv_to_rgb(0.667 * (1.0 - normalized as f32), 1.0, 1.0)
}

const FONT_CANDIDATES: [&str; 5] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

static FONT_REGISTERED: OnceLock<bool> = OnceLock::new();

/// Registers the first system font found as `sans-serif`. Without one, plots carry no text.
fn text_available() -> bool {
    *FONT_REGISTERED.get_or_init(|| {
        for candidate in FONT_CANDIDATES {
            let Ok(bytes) = fs::read(candidate) else {
                continue;
            };
            let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
            if register_font("sans-serif", FontStyle::Normal, bytes).is_ok() {
                log::debug!("heat map font: {candidate}");
                return true;
            }
        }
        log::warn!("no usable font found, heat maps are drawn without text");
        false
    })
}

fn plot_error<E: std::fmt::Display>(err: E) -> ExportError {
    ExportError::Plot(err.to_string())
}

const COLOR_BAR_WIDTH: u32 = 110;
const COLOR_BAR_STEPS: usize = 64;

/// Shift map with axes, point annotations and a colour bar. Masked cells stay white.
fn draw_heatmap<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    grid: &HeatMapGrid,
    labelled: bool,
) -> Result<(), ExportError> {
    root.fill(&WHITE).map_err(plot_error)?;
    let (width, _) = root.dim_in_pixel();
    let (map_area, bar_area) = root.split_horizontally(width.saturating_sub(COLOR_BAR_WIDTH));

    let (rows, cols) = grid.values.dim();
    let half = grid.resolution as f64 / 2.0;
    let x_range = grid.x[[0, 0]] - half..grid.x[[0, cols - 1]] + half;
    let y_range = grid.y[[0, 0]] - half..grid.y[[rows - 1, 0]] + half;
    let (min, max) = grid.value_range().unwrap_or((0.0, 1.0));

    let mut builder = ChartBuilder::on(&map_area);
    builder.margin(10);
    if labelled {
        builder
            .caption(&grid.title, ("sans-serif", 20))
            .x_label_area_size(40)
            .y_label_area_size(50);
    }
    let mut chart = builder
        .build_cartesian_2d(x_range, y_range)
        .map_err(plot_error)?;
    if labelled {
        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("x (px)")
            .y_desc("y (px)")
            .draw()
            .map_err(plot_error)?;
    }

    chart
        .draw_series(grid.values.indexed_iter().filter_map(|((i, j), value)| {
            let value = (*value)?;
            let (x, y) = (grid.x[[i, j]], grid.y[[i, j]]);
            Some(Rectangle::new(
                [(x - half, y - half), (x + half, y + half)],
                color_from_value(value, min, max).filled(),
            ))
        }))
        .map_err(plot_error)?;
    chart
        .draw_series(grid.annotations.iter().map(|a| {
            Circle::new(
                (a.position[0] as f64, a.position[1] as f64),
                3,
                BLACK.filled(),
            )
        }))
        .map_err(plot_error)?;
    if labelled {
        chart
            .draw_series(grid.annotations.iter().map(|a| {
                Text::new(
                    format!("{:.2}", a.value),
                    (a.position[0] as f64 + half, a.position[1] as f64 + half),
                    ("sans-serif", 12).into_font(),
                )
            }))
            .map_err(plot_error)?;
    }

    // colour bar
    let (lo, hi) = if max > min {
        (min, max)
    } else {
        (min - 0.5, max + 0.5)
    };
    let mut builder = ChartBuilder::on(&bar_area);
    builder.margin(10).margin_left(0);
    if labelled {
        builder.margin_top(40).y_label_area_size(60);
    }
    let mut bar = builder
        .build_cartesian_2d(0.0..1.0, lo..hi)
        .map_err(plot_error)?;
    if labelled {
        bar.configure_mesh()
            .disable_mesh()
            .disable_x_axis()
            .y_desc("shift (GHz)")
            .draw()
            .map_err(plot_error)?;
    }
    let step = (hi - lo) / COLOR_BAR_STEPS as f64;
    bar.draw_series((0..COLOR_BAR_STEPS).map(|k| {
        let t = k as f64 / (COLOR_BAR_STEPS - 1) as f64;
        let bottom = lo + step * k as f64;
        Rectangle::new(
            [(0.0, bottom), (1.0, bottom + step)],
            color_from_value(lo + t * (hi - lo), lo, hi).filled(),
        )
    }))
    .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    Ok(())
}

/// Renders the grid into a `width` × `height` RGB image, y pointing up.
pub fn render_heatmap(grid: &HeatMapGrid, (width, height): (u32, u32)) -> Result<RgbImage, ExportError> {
    if grid.values.is_empty() {
        return Err(ExportError::Empty);
    }
    let (width, height) = (width.max(COLOR_BAR_WIDTH * 2), height.max(COLOR_BAR_WIDTH));
    let mut buffer = vec![0u8; width as usize * height as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        draw_heatmap(&root, grid, text_available())?;
    }
    RgbImage::from_raw(width, height, buffer).ok_or(ExportError::Empty)
}

pub fn save_heatmap_png(path: &Path, grid: &HeatMapGrid, size: (u32, u32)) -> Result<(), ExportError> {
    let image = render_heatmap(grid, size)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heatmap::HeatMapRenderer;
    use crate::scan::ScanParameters;
    use image::Luma;
    use std::collections::BTreeMap;

    fn outcome(images: Vec<GrayImage>) -> ScanOutcome {
        ScanOutcome {
            parameters: ScanParameters {
                start_position: 0,
                length: 20,
                num_steps: 2,
            },
            shift_profile: vec![(0, 5.0), (10, 5.1), (20, 5.2)],
            image_stack: images,
            skipped_steps: vec![],
        }
    }

    #[test]
    fn test_export_scan_writes_frames_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let scan_dir = scan_export_dir(dir.path(), 0);
        let images = (0..3)
            .map(|i| GrayImage::from_pixel(16, 2, Luma([i * 40])))
            .collect();
        export_scan(&scan_dir, &outcome(images)).unwrap();
        for i in 0..3 {
            assert!(scan_dir.join(format!("frame_{i:03}.png")).exists());
        }
        assert!(scan_dir.join("scan.npz").exists());
    }

    #[test]
    fn test_stack_rejects_mixed_sizes() {
        let images = vec![GrayImage::new(16, 2), GrayImage::new(16, 3)];
        assert!(matches!(
            stack_images(&images),
            Err(ExportError::InconsistentImage { index: 1, .. })
        ));
        assert!(matches!(stack_images(&[]), Err(ExportError::Empty)));
    }

    #[test]
    fn test_color_map_runs_blue_to_red() {
        let low = color_from_value(0.0, 0.0, 1.0);
        let high = color_from_value(1.0, 0.0, 1.0);
        assert_eq!((low.0, low.1, low.2), (0, 0, 255));
        assert_eq!((high.0, high.1, high.2), (255, 0, 0));
    }

    fn has_pixel(image: &RgbImage, rgb: [u8; 3]) -> bool {
        image.pixels().any(|p| p.0 == rgb)
    }

    #[test]
    fn test_heatmap_image_spans_the_color_map() {
        let points: BTreeMap<[i64; 2], f64> = [
            ([0, 0], 5.0),
            ([100, 0], 5.2),
            ([0, 100], 5.4),
            ([100, 100], 5.6),
            ([50, 40], 5.3),
        ]
        .into_iter()
        .collect();
        let grid = HeatMapRenderer::default().plot(&points, Some(2.0));
        let image = render_heatmap(&grid, (640, 480)).unwrap();
        assert_eq!(image.dimensions(), (640, 480));
        assert!(has_pixel(&image, [0, 0, 255]));
        assert!(has_pixel(&image, [255, 0, 0]));
        assert!(has_pixel(&image, [255, 255, 255]));
    }

    #[test]
    fn test_masked_cells_render_white() {
        let points: BTreeMap<[i64; 2], f64> = [([0, 0], 5.0)].into_iter().collect();
        let grid = HeatMapRenderer::default().plot(&points, None);
        let image = render_heatmap(&grid, (400, 300)).unwrap();
        let cell = color_from_value(5.0, 5.0, 5.0);
        let colored = image
            .pixels()
            .filter(|p| p.0 == [cell.0, cell.1, cell.2])
            .count();
        let white = image.pixels().filter(|p| p.0 == [255, 255, 255]).count();
        // one coloured cell on the map, the rest of the plot area stays white
        assert!(colored > 0);
        assert!(white > colored);
    }

    #[test]
    fn test_save_heatmap_png_writes_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps").join("heatmap.png");
        let points: BTreeMap<[i64; 2], f64> = [([0, 0], 5.0), ([30, 10], 5.1)].into_iter().collect();
        let grid = HeatMapRenderer::default().plot(&points, None);
        save_heatmap_png(&path, &grid, (500, 400)).unwrap();
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (500, 400));
    }
}

//! Turns raw EMCCD line-scan buffers into the cropped strip shown to the user and the line
//! profile handed to the peak fitter.

use crate::data_container::{LineProfile, PROFILE_LENGTH};
use crate::error::AcquisitionError;
use crate::math_tools::argmax;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use ndarray::{s, Array2, ArrayView2};
use std::ops::Range;

pub const ROW_WIDTH: usize = 512;
pub const DISPLAY_WIDTH: u32 = 1024;

/// Cropping and scaling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAcquirer {
    pub row_width: usize,
    pub window_width: usize,
    /// Rows kept above the row of interest in the live strip; the strip spans `2 *` this.
    pub display_half_height: usize,
    pub display_width: u32,
    /// Brightest columns used to find the horizontal center of the spectrum.
    pub top_columns: usize,
}

impl Default for FrameAcquirer {
    fn default() -> Self {
        FrameAcquirer {
            row_width: ROW_WIDTH,
            window_width: PROFILE_LENGTH,
            display_half_height: 7,
            display_width: DISPLAY_WIDTH,
            top_columns: 10,
        }
    }
}

/// Where the spectrum sits in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionOfInterest {
    pub row: usize,
    pub mid_column: usize,
    pub columns: Range<usize>,
}

/// Output of the live pipeline.
#[derive(Debug, Clone)]
pub struct LiveFrame {
    pub display: GrayImage,
    pub profile: LineProfile,
    pub region: RegionOfInterest,
}

/// Output of the scan pipeline. A frame without a usable region still yields a blank strip.
#[derive(Debug, Clone)]
pub struct ScanFrame {
    pub display: GrayImage,
    pub profile: Option<LineProfile>,
    pub region: Option<RegionOfInterest>,
}

impl FrameAcquirer {
    /// Lays a flat buffer out as rows of `row_width` samples.
    pub fn reshape(&self, raw: &[u16]) -> Result<Array2<u16>, AcquisitionError> {
        if raw.len() % self.row_width != 0 {
            return Err(AcquisitionError::ShapeMismatch {
                len: raw.len(),
                row_width: self.row_width,
            });
        }
        Array2::from_shape_vec((raw.len() / self.row_width, self.row_width), raw.to_vec()).map_err(
            |_| AcquisitionError::ShapeMismatch {
                len: raw.len(),
                row_width: self.row_width,
            },
        )
    }

    /// Scales the frame so that its maximum becomes 255.
    pub fn normalize(frame: &Array2<u16>) -> Array2<u8> {
        let max = frame.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return Array2::zeros(frame.dim());
        }
        let scale = 255.0 / max as f64;
        frame.mapv(|v| (v as f64 * scale).round() as u8)
    }

    /// Finds the row holding the global maximum and centers the crop window on its brightest
    /// columns. Ties go to the first row in raster order. `None` for a frame without rows.
    pub fn locate(&self, scaled: &Array2<u8>) -> Option<RegionOfInterest> {
        let flat: Vec<u8> = scaled.iter().copied().collect();
        let row = argmax(&flat)? / scaled.ncols();
        let line = scaled.row(row);

        let mut order: Vec<usize> = (0..line.len()).collect();
        order.sort_by_key(|&i| line[i]);
        let brightest = &order[order.len().saturating_sub(self.top_columns)..];
        let first = brightest.iter().copied().min()?;
        let last = brightest.iter().copied().max()?;
        let mid_column = (first + last) / 2;

        let half_window = self.window_width / 2;
        let columns = mid_column.saturating_sub(half_window)..(mid_column + half_window).min(line.len());
        Some(RegionOfInterest {
            row,
            mid_column,
            columns,
        })
    }

    fn display_rows(&self, region: &RegionOfInterest, nrows: usize) -> Range<usize> {
        region.row.saturating_sub(self.display_half_height)
            ..(region.row + self.display_half_height).min(nrows)
    }

    fn profile(frame: &Array2<u16>, region: &RegionOfInterest) -> LineProfile {
        LineProfile::new(
            frame
                .slice(s![region.row, region.columns.start..region.columns.end])
                .to_owned(),
        )
    }

    /// Processes a frame for the live display. `Ok(None)` if no region can be cropped; the
    /// caller skips the frame.
    pub fn live_frame(&self, raw: &[u16]) -> Result<Option<LiveFrame>, AcquisitionError> {
        let frame = self.reshape(raw)?;
        let scaled = Self::normalize(&frame);
        let Some(region) = self.locate(&scaled) else {
            return Ok(None);
        };
        let rows = self.display_rows(&region, scaled.nrows());
        let crop = scaled.slice(s![rows, region.columns.clone()]);
        if crop.is_empty() {
            return Ok(None);
        }
        Ok(Some(LiveFrame {
            display: self.to_display(crop),
            profile: Self::profile(&frame, &region),
            region,
        }))
    }

    /// Processes a frame taken during a scan: a single-row strip plus the fitting profile.
    pub fn scan_frame(&self, raw: &[u16]) -> Result<ScanFrame, AcquisitionError> {
        let frame = self.reshape(raw)?;
        let scaled = Self::normalize(&frame);
        let region = self.locate(&scaled).filter(|r| !r.columns.is_empty());
        Ok(match region {
            Some(region) => ScanFrame {
                display: self.to_display(scaled.slice(s![region.row..region.row + 1, region.columns.clone()])),
                profile: Some(Self::profile(&frame, &region)),
                region: Some(region),
            },
            None => {
                log::warn!("no region of interest in scan frame, using a blank strip");
                ScanFrame {
                    display: self.blank_scan_display(),
                    profile: None,
                    region: None,
                }
            }
        })
    }

    /// Zero-filled strip with the shape of a regular scan strip.
    pub fn blank_scan_display(&self) -> GrayImage {
        let blank = Array2::<u8>::zeros((1, self.window_width));
        self.to_display(blank.view())
    }

    /// Resizes a crop to `display_width`, keeping the aspect ratio.
    fn to_display(&self, crop: ArrayView2<u8>) -> GrayImage {
        let (height, width) = crop.dim();
        let strip = GrayImage::from_fn(width as u32, height as u32, |x, y| {
            Luma([crop[[y as usize, x as usize]]])
        });
        let display_height =
            ((height as f64 * self.display_width as f64 / width as f64) as u32).max(1);
        imageops::resize(&strip, self.display_width, display_height, FilterType::Nearest)
    }
}

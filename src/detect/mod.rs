//! Checkerboard locator.
//!
//! Finds the inner corners of a (cols x rows) checkerboard in a grayscale
//! image and returns them in row-major board order with sub-pixel accuracy.
//!
//! Detection runs a prioritized list of strategies and stops at the first
//! that yields a full, valid lattice:
//!
//! 1. **Standard**: corner response on the image as-is.
//! 2. **Upscale2x**: 2x Catmull-Rom upscale, helps when the board is small
//!    in frame; coordinates are scaled back afterwards.
//! 3. **Blur**: light Gaussian blur, helps on noisy or aliased input.
//!
//! An optional region of interest restricts the search to a sub-rectangle
//! given in relative coordinates; reported corners are always in the full
//! image frame.

use image::{imageops, GrayImage};
use log::{debug, info};
use nalgebra::Point2;

use crate::board::BoardSpec;

pub mod grid;
pub mod response;
pub mod subpix;

#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error(
        "No {cols}x{rows} checkerboard found after {strategies_tried} detection strategies. \
         Check that the full board is visible, evenly lit and unoccluded, \
         or adjust the region of interest."
    )]
    BoardNotFound {
        cols: usize,
        rows: usize,
        strategies_tried: usize,
    },
    #[error("Invalid region of interest: {0}")]
    InvalidRegion(String),
}

/// Search region in coordinates relative to the image size, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionOfInterest {
    pub h_min: f64,
    pub h_max: f64,
    pub w_min: f64,
    pub w_max: f64,
}

impl RegionOfInterest {
    /// The lower-center crop used with the floor-mounted reference board:
    /// bottom 60% of the image, middle 60% of its width.
    pub fn lower_center() -> Self {
        RegionOfInterest {
            h_min: 0.4,
            h_max: 1.0,
            w_min: 0.2,
            w_max: 0.8,
        }
    }

    fn validate(&self) -> Result<(), DetectError> {
        let ok = (0.0..=1.0).contains(&self.h_min)
            && (0.0..=1.0).contains(&self.h_max)
            && (0.0..=1.0).contains(&self.w_min)
            && (0.0..=1.0).contains(&self.w_max)
            && self.h_min < self.h_max
            && self.w_min < self.w_max;
        if ok {
            Ok(())
        } else {
            Err(DetectError::InvalidRegion(format!("{self:?}")))
        }
    }

    /// Crops the region out of `image`. Returns the crop plus the pixel
    /// offset of its top-left corner in the full image.
    fn crop(&self, image: &GrayImage) -> Result<(GrayImage, f64, f64), DetectError> {
        self.validate()?;
        let (width, height) = image.dimensions();
        let x0 = (self.w_min * width as f64).round() as u32;
        let y0 = (self.h_min * height as f64).round() as u32;
        let x1 = ((self.w_max * width as f64).round() as u32).min(width);
        let y1 = ((self.h_max * height as f64).round() as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return Err(DetectError::InvalidRegion(format!(
                "{self:?} crops {width}x{height} down to nothing"
            )));
        }
        let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
        Ok((crop, x0 as f64, y0 as f64))
    }
}

/// One detection attempt variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Standard,
    Upscale2x,
    Blur,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Standard => "standard",
            Strategy::Upscale2x => "upscale-2x",
            Strategy::Blur => "blur",
        }
    }
}

/// Locator configuration.
#[derive(Debug, Clone)]
pub struct DetectParams {
    /// Strategies, tried in order until one succeeds.
    pub strategies: Vec<Strategy>,
    /// Optional relative search region.
    pub roi: Option<RegionOfInterest>,
    /// Non-maximum-suppression radius on the response map, in pixels.
    pub nms_radius: u32,
    /// Candidate threshold relative to the strongest response, in (0, 1).
    pub response_threshold: f32,
}

impl Default for DetectParams {
    fn default() -> Self {
        DetectParams {
            strategies: vec![Strategy::Standard, Strategy::Upscale2x, Strategy::Blur],
            roi: None,
            nms_radius: 5,
            response_threshold: 0.2,
        }
    }
}

impl DetectParams {
    /// No fallbacks. Used during intrinsic calibration where a missed board
    /// is simply skipped.
    pub fn standard_only() -> Self {
        DetectParams {
            strategies: vec![Strategy::Standard],
            ..Default::default()
        }
    }
}

/// Finds all inner corners of the board, sub-pixel refined, in row-major
/// board order and full-image pixel coordinates.
///
/// Fails with [`DetectError::BoardNotFound`] only after every configured
/// strategy has been tried.
pub fn locate_checkerboard(
    image: &GrayImage,
    board: &BoardSpec,
    params: &DetectParams,
) -> Result<Vec<Point2<f64>>, DetectError> {
    let cropped;
    let (work, off_x, off_y): (&GrayImage, f64, f64) = match &params.roi {
        Some(roi) => {
            let (c, ox, oy) = roi.crop(image)?;
            cropped = c;
            (&cropped, ox, oy)
        }
        None => (image, 0.0, 0.0),
    };

    for strategy in &params.strategies {
        let Some(coarse) = detect_coarse(work, board, params, *strategy) else {
            debug!(
                "checkerboard {}x{}: strategy '{}' found no valid lattice",
                board.cols,
                board.rows,
                strategy.name()
            );
            continue;
        };

        // Refinement always runs on the unmodified (cropped) image so the
        // upscale and blur variants cannot bias the final coordinates.
        let corners: Vec<Point2<f64>> = coarse
            .into_iter()
            .map(|p| {
                let refined = subpix::refine_corner(work, p);
                Point2::new(refined.x + off_x, refined.y + off_y)
            })
            .collect();

        info!(
            "checkerboard {}x{} located with strategy '{}'",
            board.cols,
            board.rows,
            strategy.name()
        );
        return Ok(corners);
    }

    Err(DetectError::BoardNotFound {
        cols: board.cols,
        rows: board.rows,
        strategies_tried: params.strategies.len(),
    })
}

/// Runs one strategy: response map, candidate extraction, lattice ordering.
/// Coordinates come back in the frame of `work`.
fn detect_coarse(
    work: &GrayImage,
    board: &BoardSpec,
    params: &DetectParams,
    strategy: Strategy,
) -> Option<Vec<Point2<f64>>> {
    let (prepared, scale) = match strategy {
        Strategy::Standard => (None, 1.0),
        Strategy::Upscale2x => {
            let (w, h) = work.dimensions();
            let up = imageops::resize(work, w * 2, h * 2, imageops::FilterType::CatmullRom);
            (Some(up), 2.0)
        }
        Strategy::Blur => (Some(imageops::blur(work, 1.0)), 1.0),
    };
    let target = prepared.as_ref().unwrap_or(work);

    let (width, height) = target.dimensions();
    let map = response::response_map(target);
    // The NMS radius tracks the upscale so one physical corner still
    // suppresses its neighborhood.
    let nms = (params.nms_radius as f64 * scale) as u32;
    let candidates =
        response::extract_candidates(&map, width, height, nms, params.response_threshold);

    let grid = grid::order_into_grid(&candidates, board.cols, board.rows)?;
    Some(
        grid.into_iter()
            .map(|p| Point2::new(p.x / scale, p.y / scale))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Axis-aligned checkerboard with `cols x rows` inner corners.
    fn board_image(
        cols: usize,
        rows: usize,
        square: u32,
        origin_x: u32,
        origin_y: u32,
        width: u32,
        height: u32,
    ) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let inside = x >= origin_x
                && y >= origin_y
                && x < origin_x + (cols as u32 + 1) * square
                && y < origin_y + (rows as u32 + 1) * square;
            if !inside {
                return Luma([200]);
            }
            let sx = (x - origin_x) / square;
            let sy = (y - origin_y) / square;
            Luma([if (sx + sy) % 2 == 0 { 25 } else { 230 }])
        })
    }

    #[test]
    fn standard_strategy_finds_ordered_corners() {
        let board = BoardSpec {
            cols: 5,
            rows: 4,
            square_size: 1.0,
        };
        let image = board_image(5, 4, 24, 30, 30, 240, 200);
        let corners =
            locate_checkerboard(&image, &board, &DetectParams::standard_only()).expect("corners");

        assert_eq!(corners.len(), 20);
        // First inner corner is one square in from the pattern origin.
        assert!((corners[0].x - 54.0).abs() < 1.0, "x0 = {}", corners[0].x);
        assert!((corners[0].y - 54.0).abs() < 1.0, "y0 = {}", corners[0].y);
        // Row-major: next corner is one square to the right.
        assert!((corners[1].x - corners[0].x - 24.0).abs() < 1.0);
        assert!((corners[1].y - corners[0].y).abs() < 1.0);
    }

    #[test]
    fn roi_crop_reports_full_image_coordinates() {
        let board = BoardSpec {
            cols: 5,
            rows: 4,
            square_size: 1.0,
        };
        // Board sits in the lower-center region of a larger frame.
        let image = board_image(5, 4, 24, 200, 260, 480, 480);

        let full = locate_checkerboard(&image, &board, &DetectParams::standard_only()).unwrap();
        let mut params = DetectParams::standard_only();
        params.roi = Some(RegionOfInterest::lower_center());
        let cropped = locate_checkerboard(&image, &board, &params).unwrap();

        for (a, b) in full.iter().zip(cropped.iter()) {
            assert!((a - b).norm() < 1.0, "full {a:?} vs cropped {b:?}");
        }
    }

    #[test]
    fn missing_board_reports_not_found() {
        let board = BoardSpec::default();
        let image = GrayImage::from_pixel(320, 240, Luma([128]));
        let err = locate_checkerboard(&image, &board, &DetectParams::default()).unwrap_err();
        match err {
            DetectError::BoardNotFound {
                cols,
                rows,
                strategies_tried,
            } => {
                assert_eq!((cols, rows), (9, 6));
                assert_eq!(strategies_tried, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_roi_is_rejected() {
        let board = BoardSpec::default();
        let image = GrayImage::from_pixel(64, 64, Luma([128]));
        let mut params = DetectParams::standard_only();
        params.roi = Some(RegionOfInterest {
            h_min: 0.9,
            h_max: 0.1,
            w_min: 0.0,
            w_max: 1.0,
        });
        assert!(matches!(
            locate_checkerboard(&image, &board, &params),
            Err(DetectError::InvalidRegion(_))
        ));
    }
}

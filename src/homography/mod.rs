//! Planar homography estimation and the image-to-metric-canvas estimator.
//!
//! The core solver is the normalized direct linear transform: both point
//! sets are Hartley-normalized (centroid at the origin, mean distance
//! sqrt(2)), the stacked 2N x 9 system `A h = 0` is solved by SVD, and the
//! result is de-normalized and scaled so `H[2,2] = 1`. A seeded RANSAC loop
//! wraps the solver so isolated bad correspondences cannot skew the fit.
//!
//! [`HomographyEstimator`] drives the full reference-image workflow:
//! undistort the photo, locate the board with the fallback chain, build the
//! metric destination grid, and solve for the homography that maps
//! undistorted image pixels onto the bird's-eye canvas.

use image::{GrayImage, RgbImage};
use log::info;
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::board::BoardSpec;
use crate::camera::{CameraModelError, RadTanModel, Resolution};
use crate::detect::{locate_checkerboard, DetectError, DetectParams, RegionOfInterest};
use crate::rectify;

#[derive(thiserror::Error, Debug)]
pub enum HomographyError {
    #[error("Need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("Degenerate point configuration, homography is not unique")]
    Degenerate,
    #[error("RANSAC found no model with at least {required} inliers (best: {best})")]
    NoConsensus { required: usize, best: usize },
    #[error(
        "Reference image is {actual} but the camera model was calibrated at {expected}; \
         re-shoot the reference or rescale the calibration first"
    )]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },
    #[error(transparent)]
    Detection(#[from] DetectError),
    #[error(transparent)]
    CameraModel(#[from] CameraModelError),
}

/// Hartley normalization: translate the centroid to the origin and scale so
/// the mean distance from it is sqrt(2). Returns the similarity transform.
fn normalize_points(points: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let scale = if mean_dist > f64::EPSILON {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let transform = Matrix3::new(
        scale, 0.0, -scale * cx, //
        0.0, scale, -scale * cy, //
        0.0, 0.0, 1.0,
    );
    let normalized = points
        .iter()
        .map(|p| Point2::new(scale * (p.x - cx), scale * (p.y - cy)))
        .collect();
    (normalized, transform)
}

/// Direct linear transform on all given correspondences.
pub fn dlt_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(HomographyError::NotEnoughPoints(n.min(dst.len())));
    }

    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y) = (s.x, s.y);
        let (u, v) = (d.x, d.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t.ok_or(HomographyError::Degenerate)?;
    let h_vec = v_t.row(v_t.nrows() - 1);

    let h_n = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2], //
        h_vec[3], h_vec[4], h_vec[5], //
        h_vec[6], h_vec[7], h_vec[8],
    );

    let t_dst_inv = t_dst.try_inverse().ok_or(HomographyError::Degenerate)?;
    let mut h = t_dst_inv * h_n * t_src;

    let w = h[(2, 2)];
    if w.abs() < 1e-12 {
        return Err(HomographyError::Degenerate);
    }
    h /= w;
    Ok(h)
}

/// Applies `h` to a point; returns `None` at the line at infinity.
pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    (q.z.abs() > f64::EPSILON).then(|| Point2::new(q.x / q.z, q.y / q.z))
}

/// Symmetric-free forward transfer error in destination pixels.
fn transfer_error(h: &Matrix3<f64>, src: &Point2<f64>, dst: &Point2<f64>) -> f64 {
    match apply_homography(h, src) {
        Some(mapped) => (mapped - dst).norm(),
        None => f64::INFINITY,
    }
}

/// RANSAC controls for the homography solve.
#[derive(Debug, Clone)]
pub struct RansacOptions {
    /// Maximum sampling iterations.
    pub max_iters: usize,
    /// Inlier threshold on the forward transfer error, destination pixels.
    pub threshold: f64,
    /// Minimum inlier count for a model to be accepted.
    pub min_inliers: usize,
    /// RNG seed, fixed so estimation is reproducible.
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        RansacOptions {
            max_iters: 500,
            threshold: 3.0,
            min_inliers: 10,
            seed: 42,
        }
    }
}

/// Robust homography fit: minimal 4-point samples, inlier scoring by forward
/// transfer error, final refit on the best inlier set.
pub fn ransac_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    options: &RansacOptions,
) -> Result<Matrix3<f64>, HomographyError> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return Err(HomographyError::NotEnoughPoints(n.min(dst.len())));
    }

    let mut rng = StdRng::seed_from_u64(options.seed);
    let indices: Vec<usize> = (0..n).collect();

    let mut best_inliers: Vec<usize> = Vec::new();
    for _ in 0..options.max_iters {
        let sample: Vec<usize> = indices
            .choose_multiple(&mut rng, 4)
            .cloned()
            .collect();
        let s: Vec<Point2<f64>> = sample.iter().map(|&i| src[i]).collect();
        let d: Vec<Point2<f64>> = sample.iter().map(|&i| dst[i]).collect();

        let Ok(h) = dlt_homography(&s, &d) else {
            continue;
        };

        let inliers: Vec<usize> = (0..n)
            .filter(|&i| transfer_error(&h, &src[i], &dst[i]) < options.threshold)
            .collect();
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            if best_inliers.len() == n {
                break;
            }
        }
    }

    let required = options.min_inliers.max(4);
    if best_inliers.len() < required {
        return Err(HomographyError::NoConsensus {
            required,
            best: best_inliers.len(),
        });
    }

    let s: Vec<Point2<f64>> = best_inliers.iter().map(|&i| src[i]).collect();
    let d: Vec<Point2<f64>> = best_inliers.iter().map(|&i| dst[i]).collect();
    dlt_homography(&s, &d)
}

/// Configuration for the reference-image homography workflow.
#[derive(Debug, Clone)]
pub struct HomographyConfig {
    /// Physical board on the floor.
    pub board: BoardSpec,
    /// Output scale: canvas pixels per physical unit (10 px/cm by default).
    pub pixels_per_unit: f64,
    /// Canvas offset of the board's first inner corner, in pixels.
    pub offset_x: f64,
    pub offset_y: f64,
    /// Optional search region for the board in the reference image.
    pub roi: Option<RegionOfInterest>,
    /// Robust-fit controls.
    pub ransac: RansacOptions,
}

impl Default for HomographyConfig {
    fn default() -> Self {
        HomographyConfig {
            board: BoardSpec::default(),
            pixels_per_unit: 10.0,
            offset_x: 600.0,
            offset_y: 1500.0,
            roi: Some(RegionOfInterest::lower_center()),
            ransac: RansacOptions::default(),
        }
    }
}

/// Result of the reference-image workflow.
#[derive(Debug, Clone)]
pub struct HomographyEstimate {
    /// Maps undistorted image pixels to bird's-eye canvas pixels.
    pub homography: Matrix3<f64>,
    /// Canvas scale the homography was built for.
    pub pixels_per_unit: f64,
    /// Detected corners on the undistorted reference image, row-major.
    pub corners: Vec<Point2<f64>>,
}

/// Estimates the image-to-canvas homography from one reference photo of the
/// board lying flat on the ground plane.
pub struct HomographyEstimator {
    config: HomographyConfig,
}

impl HomographyEstimator {
    pub fn new(config: HomographyConfig) -> Self {
        HomographyEstimator { config }
    }

    /// Runs the full workflow on a distorted reference photo.
    ///
    /// The photo is undistorted with the model's optimal new camera matrix
    /// (no pixel loss), the board is located with the full strategy chain,
    /// and the homography is solved against the metric destination grid.
    pub fn estimate(
        &self,
        reference: &RgbImage,
        model: &RadTanModel,
    ) -> Result<HomographyEstimate, HomographyError> {
        let actual = Resolution {
            width: reference.width(),
            height: reference.height(),
        };
        if actual != model.resolution {
            return Err(HomographyError::ResolutionMismatch {
                expected: model.resolution,
                actual,
            });
        }

        let new_intrinsics = model.optimal_new_intrinsics()?;
        let undistorted = rectify::undistort_image(reference, model, &new_intrinsics)?;
        let gray = image::DynamicImage::ImageRgb8(undistorted).into_luma8();

        self.estimate_from_undistorted(&gray)
    }

    /// Same workflow starting from an already-undistorted grayscale image.
    pub fn estimate_from_undistorted(
        &self,
        undistorted: &GrayImage,
    ) -> Result<HomographyEstimate, HomographyError> {
        let params = DetectParams {
            roi: self.config.roi,
            ..DetectParams::default()
        };
        let corners = locate_checkerboard(undistorted, &self.config.board, &params)?;

        let dst = self.destination_grid();
        let homography = ransac_homography(&corners, &dst, &self.config.ransac)?;

        info!(
            "homography estimated from {} corners at {} px/unit",
            corners.len(),
            self.config.pixels_per_unit
        );

        Ok(HomographyEstimate {
            homography,
            pixels_per_unit: self.config.pixels_per_unit,
            corners,
        })
    }

    /// Canvas-space targets for the board corners, row-major to match the
    /// locator output.
    fn destination_grid(&self) -> Vec<Point2<f64>> {
        let board = &self.config.board;
        let step = board.square_size * self.config.pixels_per_unit;
        let mut grid = Vec::with_capacity(board.corner_count());
        for i in 0..board.rows {
            for j in 0..board.cols {
                grid.push(Point2::new(
                    self.config.offset_x + j as f64 * step,
                    self.config.offset_y + i as f64 * step,
                ));
            }
        }
        grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn project_all(h: &Matrix3<f64>, points: &[Point2<f64>]) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| apply_homography(h, p).unwrap())
            .collect()
    }

    fn sample_grid() -> Vec<Point2<f64>> {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..9 {
                points.push(Point2::new(
                    120.0 + j as f64 * 35.0 + i as f64 * 4.0,
                    90.0 + i as f64 * 33.0,
                ));
            }
        }
        points
    }

    fn ground_truth() -> Matrix3<f64> {
        Matrix3::new(
            1.2, 0.1, 30.0, //
            -0.05, 1.4, 120.0, //
            1e-4, 2e-4, 1.0,
        )
    }

    #[test]
    fn dlt_recovers_exact_homography() {
        let src = sample_grid();
        let h_true = ground_truth();
        let dst = project_all(&h_true, &src);

        let h = dlt_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            let mapped = apply_homography(&h, s).unwrap();
            assert_relative_eq!(mapped.x, d.x, epsilon = 1e-6);
            assert_relative_eq!(mapped.y, d.y, epsilon = 1e-6);
        }
        assert_relative_eq!(h[(2, 2)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn dlt_rejects_too_few_points() {
        let src = vec![Point2::new(0.0, 0.0); 3];
        let dst = src.clone();
        assert!(matches!(
            dlt_homography(&src, &dst),
            Err(HomographyError::NotEnoughPoints(3))
        ));
    }

    #[test]
    fn ransac_survives_outliers() {
        let src = sample_grid();
        let h_true = ground_truth();
        let mut dst = project_all(&h_true, &src);
        // Corrupt a handful of correspondences badly.
        for k in [3usize, 17, 29, 41] {
            dst[k].x += 250.0;
            dst[k].y -= 180.0;
        }

        let h = ransac_homography(&src, &dst, &RansacOptions::default()).unwrap();
        let mut inliers = 0;
        for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
            if [3usize, 17, 29, 41].contains(&i) {
                continue;
            }
            let mapped = apply_homography(&h, s).unwrap();
            assert_relative_eq!(mapped.x, d.x, epsilon = 1e-4);
            assert_relative_eq!(mapped.y, d.y, epsilon = 1e-4);
            inliers += 1;
        }
        assert_eq!(inliers, 50);
    }

    #[test]
    fn ransac_is_deterministic_for_a_fixed_seed() {
        let src = sample_grid();
        let dst = project_all(&ground_truth(), &src);
        let options = RansacOptions::default();
        let h1 = ransac_homography(&src, &dst, &options).unwrap();
        let h2 = ransac_homography(&src, &dst, &options).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn destination_grid_is_metric() {
        let estimator = HomographyEstimator::new(HomographyConfig::default());
        let grid = estimator.destination_grid();
        assert_eq!(grid.len(), 54);
        assert_relative_eq!(grid[0].x, 600.0);
        assert_relative_eq!(grid[0].y, 1500.0);
        // One square to the right: 3.86 units * 10 px/unit.
        assert_relative_eq!(grid[1].x - grid[0].x, 38.6, epsilon = 1e-12);
        // One row down.
        assert_relative_eq!(grid[9].y - grid[0].y, 38.6, epsilon = 1e-12);
    }
}

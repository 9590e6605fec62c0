//! Intrinsic calibration from checkerboard photographs.
//!
//! The calibrator detects the board in every supplied image (skipping, with
//! a warning, any image where detection fails), seeds the camera parameters
//! with Zhang's closed-form solution over the per-view board homographies,
//! and refines everything jointly with Levenberg-Marquardt. The result is a
//! [`RadTanModel`] plus a reprojection-error report.

use image::GrayImage;
use log::{info, warn};
use nalgebra::{DVector, Matrix3, Point2, Rotation3, SMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::board::{BoardSpec, CheckerboardObservation};
use crate::camera::{CameraModelError, Intrinsics, RadTanModel, Resolution};
use crate::detect::{locate_checkerboard, DetectParams};
use crate::homography::{dlt_homography, HomographyError};

pub mod optimize;

use optimize::ViewPose;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error(
        "No usable calibration images: the checkerboard was detected in {found} of {total} \
         images, need at least {needed}. Capture sharper, well-lit views of the full board."
    )]
    InsufficientObservations {
        found: usize,
        total: usize,
        needed: usize,
    },
    #[error("Calibration initialization failed: {0}")]
    Initialization(String),
    #[error(transparent)]
    Homography(#[from] HomographyError),
    #[error(transparent)]
    CameraModel(#[from] CameraModelError),
}

/// Reprojection-error statistics after refinement, in pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReprojectionReport {
    pub rmse: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
}

impl ReprojectionReport {
    fn from_errors(mut errors: Vec<f64>) -> Self {
        errors.sort_by(f64::total_cmp);
        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let variance = errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        ReprojectionReport {
            rmse,
            mean,
            median: errors[errors.len() / 2],
            min: errors[0],
            max: errors[errors.len() - 1],
            std_dev: variance.sqrt(),
        }
    }
}

/// Result of a calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub model: RadTanModel,
    pub report: ReprojectionReport,
    /// Images in which the board was found and used.
    pub used_images: usize,
    /// Images skipped because detection failed.
    pub skipped_images: usize,
}

/// Calibrates from grayscale photographs of the board.
///
/// Detection uses the standard strategy only: a calibration set has many
/// views, so a missed board is cheaper to skip than to rescue.
pub fn calibrate_images(
    images: &[GrayImage],
    board: &BoardSpec,
    resolution: Resolution,
) -> Result<CalibrationOutcome, CalibrationError> {
    let params = DetectParams::standard_only();
    let mut observations = Vec::new();
    let mut skipped = 0usize;

    for (index, image) in images.iter().enumerate() {
        match locate_checkerboard(image, board, &params) {
            Ok(corners) => observations.push(CheckerboardObservation::new(corners, board)),
            Err(err) => {
                warn!("calibration image {index}: {err}; skipping");
                skipped += 1;
            }
        }
    }

    if observations.is_empty() {
        return Err(CalibrationError::InsufficientObservations {
            found: 0,
            total: images.len(),
            needed: 1,
        });
    }
    info!(
        "calibrating from {} of {} images",
        observations.len(),
        images.len()
    );

    let mut outcome = calibrate_from_observations(&observations, resolution)?;
    outcome.skipped_images = skipped;
    Ok(outcome)
}

/// Calibrates from already-detected board observations. Exposed separately
/// so synthetic correspondences can drive the solver directly.
pub fn calibrate_from_observations(
    observations: &[CheckerboardObservation],
    resolution: Resolution,
) -> Result<CalibrationOutcome, CalibrationError> {
    if observations.is_empty() {
        return Err(CalibrationError::InsufficientObservations {
            found: 0,
            total: 0,
            needed: 1,
        });
    }

    // Per-view board-plane homographies drive both the closed-form
    // intrinsics and the pose seeds.
    let mut view_homographies = Vec::with_capacity(observations.len());
    for obs in observations {
        let board_xy: Vec<Point2<f64>> = obs
            .object_points
            .iter()
            .map(|p| Point2::new(p.x, p.y))
            .collect();
        view_homographies.push(dlt_homography(&board_xy, &obs.image_points)?);
    }

    let initial = match zhang_intrinsics(&view_homographies) {
        Some(intrinsics) => intrinsics,
        None => {
            // Closed form needs two well-conditioned views; seed from the
            // resolution instead and let the refinement do the work.
            let f = 1.2 * resolution.width.max(resolution.height) as f64;
            Intrinsics {
                fx: f,
                fy: f,
                cx: resolution.width as f64 / 2.0,
                cy: resolution.height as f64 / 2.0,
            }
        }
    };

    let k = initial.to_matrix();
    let poses: Vec<ViewPose> = view_homographies
        .iter()
        .map(|h| pose_from_homography(&k, h))
        .collect::<Result<_, _>>()?;

    let camera_params = DVector::from_vec(vec![
        initial.fx, initial.fy, initial.cx, initial.cy, 0.0, 0.0, 0.0, 0.0, 0.0,
    ]);
    let (refined_cam, refined_poses) = optimize::refine(&camera_params, &poses, observations)?;

    let model = RadTanModel::new(&refined_cam, resolution)?;
    let report = reprojection_report(&model, &refined_poses, observations)?;
    info!(
        "calibration finished: rmse {:.4} px over {} views",
        report.rmse,
        observations.len()
    );

    Ok(CalibrationOutcome {
        model,
        report,
        used_images: observations.len(),
        skipped_images: 0,
    })
}

/// Zhang's closed-form intrinsics from per-view board homographies.
/// Returns `None` when there are too few views or the solution is not
/// positive definite (degenerate geometry).
fn zhang_intrinsics(homographies: &[Matrix3<f64>]) -> Option<Intrinsics> {
    if homographies.len() < 2 {
        return None;
    }

    // Row v_ij of the constraint system, built from columns i and j of H.
    let v_row = |h: &Matrix3<f64>, i: usize, j: usize| -> SMatrix<f64, 1, 6> {
        SMatrix::<f64, 1, 6>::from_row_slice(&[
            h[(0, i)] * h[(0, j)],
            h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
            h[(1, i)] * h[(1, j)],
            h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
            h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
            h[(2, i)] * h[(2, j)],
        ])
    };

    let mut v = nalgebra::DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (idx, h) in homographies.iter().enumerate() {
        v.row_mut(2 * idx).copy_from(&v_row(h, 0, 1));
        v.row_mut(2 * idx + 1)
            .copy_from(&(v_row(h, 0, 0) - v_row(h, 1, 1)));
    }

    let svd = v.svd(false, true);
    let v_t = svd.v_t?;
    let b = v_t.row(v_t.nrows() - 1);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return None;
    }
    let cy = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + cy * (b12 * b13 - b11 * b23)) / b11;

    let fx2 = lambda / b11;
    let fy2 = lambda * b11 / denom;
    if fx2 <= 0.0 || fy2 <= 0.0 {
        return None;
    }
    let fx = fx2.sqrt();
    let fy = fy2.sqrt();
    let cx = -b13 * fx * fx / lambda;

    let intrinsics = Intrinsics { fx, fy, cx, cy };
    crate::camera::validation::validate_intrinsics(&intrinsics)
        .ok()
        .map(|_| intrinsics)
}

/// Pose seed for one view: decompose the board homography against K,
/// orthonormalize the rotation, and keep the board in front of the camera.
fn pose_from_homography(
    k: &Matrix3<f64>,
    h: &Matrix3<f64>,
) -> Result<ViewPose, CalibrationError> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| CalibrationError::Initialization("Camera matrix is singular".to_string()))?;

    let a = k_inv * h;
    let h1 = a.column(0).into_owned();
    let h2 = a.column(1).into_owned();
    let h3 = a.column(2).into_owned();

    let norm = h1.norm();
    if norm < 1e-12 {
        return Err(CalibrationError::Initialization(
            "Degenerate view homography".to_string(),
        ));
    }
    let mut scale = 1.0 / norm;
    // The board must lie in front of the camera.
    if h3.z * scale < 0.0 {
        scale = -scale;
    }

    let r1: Vector3<f64> = h1 * scale;
    let r2: Vector3<f64> = h2 * scale;
    let r3 = r1.cross(&r2);
    let translation: Vector3<f64> = h3 * scale;

    let approx_r = Matrix3::from_columns(&[r1, r2, r3]);
    // Nearest true rotation in the Frobenius sense.
    let svd = approx_r.svd(true, true);
    let (u, v_t) = (
        svd.u.ok_or_else(|| {
            CalibrationError::Initialization("Rotation orthonormalization failed".to_string())
        })?,
        svd.v_t.ok_or_else(|| {
            CalibrationError::Initialization("Rotation orthonormalization failed".to_string())
        })?,
    );
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        r = u_fixed * v_t;
    }

    let rotation = Rotation3::from_matrix_unchecked(r);
    let axis_angle = rotation.scaled_axis();

    Ok(ViewPose {
        rotation: axis_angle,
        translation,
    })
}

/// Per-corner reprojection distances over all views.
fn reprojection_report(
    model: &RadTanModel,
    poses: &[ViewPose],
    observations: &[CheckerboardObservation],
) -> Result<ReprojectionReport, CalibrationError> {
    let mut errors = Vec::new();
    for (pose, obs) in poses.iter().zip(observations.iter()) {
        for (obj, img) in obs.object_points.iter().zip(obs.image_points.iter()) {
            let cam_point = pose.transform(obj);
            let projected = model.project(&cam_point)?;
            errors.push((projected - img.coords).norm());
        }
    }
    if errors.is_empty() {
        return Err(CalibrationError::Initialization(
            "No correspondences to evaluate".to_string(),
        ));
    }
    Ok(ReprojectionReport::from_errors(errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ground_truth_model() -> RadTanModel {
        RadTanModel {
            intrinsics: Intrinsics {
                fx: 1400.0,
                fy: 1405.0,
                cx: 960.0,
                cy: 540.0,
            },
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            distortions: [-0.12, 0.03, 0.0008, -0.0005, 0.0],
        }
    }

    fn synthetic_observation(model: &RadTanModel, board: &BoardSpec, pose: &ViewPose) -> CheckerboardObservation {
        let object_points = board.object_points();
        let image_points = object_points
            .iter()
            .map(|obj| {
                let c = pose.transform(obj);
                let px = model.project(&c).unwrap();
                Point2::new(px.x, px.y)
            })
            .collect();
        CheckerboardObservation {
            image_points,
            object_points,
        }
    }

    fn synthetic_views(model: &RadTanModel, board: &BoardSpec) -> Vec<CheckerboardObservation> {
        // Varied tilts and standoffs around a board roughly centered in view.
        let poses = [
            ViewPose {
                rotation: Vector3::new(0.15, 0.05, 0.02),
                translation: Vector3::new(-15.0, -10.0, 80.0),
            },
            ViewPose {
                rotation: Vector3::new(-0.1, 0.25, -0.03),
                translation: Vector3::new(-12.0, -8.0, 95.0),
            },
            ViewPose {
                rotation: Vector3::new(0.05, -0.2, 0.1),
                translation: Vector3::new(-18.0, -12.0, 70.0),
            },
            ViewPose {
                rotation: Vector3::new(0.3, 0.1, -0.08),
                translation: Vector3::new(-14.0, -6.0, 110.0),
            },
            ViewPose {
                rotation: Vector3::new(-0.2, -0.1, 0.05),
                translation: Vector3::new(-10.0, -14.0, 85.0),
            },
        ];
        poses
            .iter()
            .map(|pose| synthetic_observation(model, board, pose))
            .collect()
    }

    #[test]
    fn recovers_ground_truth_from_synthetic_views() {
        let model = ground_truth_model();
        let board = BoardSpec::default();
        let observations = synthetic_views(&model, &board);

        let outcome = calibrate_from_observations(&observations, model.resolution).unwrap();

        assert!(outcome.report.rmse < 0.1, "rmse = {}", outcome.report.rmse);
        assert_relative_eq!(outcome.model.intrinsics.fx, 1400.0, epsilon = 2.0);
        assert_relative_eq!(outcome.model.intrinsics.fy, 1405.0, epsilon = 2.0);
        assert_relative_eq!(outcome.model.intrinsics.cx, 960.0, epsilon = 2.0);
        assert_relative_eq!(outcome.model.intrinsics.cy, 540.0, epsilon = 2.0);
        assert_relative_eq!(outcome.model.distortions[0], -0.12, epsilon = 0.01);
        assert_eq!(outcome.used_images, 5);
    }

    #[test]
    fn zhang_initialization_is_close_on_clean_views() {
        let model = ground_truth_model();
        let board = BoardSpec::default();
        let observations = synthetic_views(&model, &board);

        let homographies: Vec<Matrix3<f64>> = observations
            .iter()
            .map(|obs| {
                let board_xy: Vec<Point2<f64>> = obs
                    .object_points
                    .iter()
                    .map(|p| Point2::new(p.x, p.y))
                    .collect();
                dlt_homography(&board_xy, &obs.image_points).unwrap()
            })
            .collect();

        let init = zhang_intrinsics(&homographies).expect("closed form");
        // Distortion biases the closed form; it only needs to be in the
        // basin of attraction.
        assert!((init.fx - 1400.0).abs() / 1400.0 < 0.2, "fx = {}", init.fx);
        assert!((init.cx - 960.0).abs() < 200.0, "cx = {}", init.cx);
    }

    #[test]
    fn single_view_falls_back_to_resolution_seed() {
        let model = ground_truth_model();
        let board = BoardSpec::default();
        let observations = &synthetic_views(&model, &board)[..1];

        // One view cannot pin down all intrinsics; the run must still
        // complete and fit the observations it has.
        let outcome = calibrate_from_observations(observations, model.resolution).unwrap();
        assert!(outcome.report.rmse < 2.0, "rmse = {}", outcome.report.rmse);
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = calibrate_from_observations(
            &[],
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientObservations { found: 0, .. }
        ));
    }
}

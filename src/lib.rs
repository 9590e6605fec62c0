//! # birdseye-tools
//!
//! Single-camera geometric calibration and metric bird's-eye rectification.
//!
//! The crate covers the full pipeline from checkerboard photographs to
//! top-down video frames:
//!
//! - **[`calibrate`]**: intrinsic calibration. Detects the board in a set of
//!   photos, seeds with Zhang's closed form, refines camera matrix and
//!   radial-tangential distortion with Levenberg-Marquardt.
//! - **[`detect`]**: the checkerboard locator with its fallback strategy
//!   chain and optional region-of-interest crop.
//! - **[`homography`]**: image-to-metric-canvas homography from one
//!   reference photo of the board on the ground plane (normalized DLT
//!   inside RANSAC).
//! - **[`bundle`]**: the persisted [`GeometryBundle`] tying camera matrix,
//!   distortion, homography and capture resolution together, plus exact
//!   rescaling to other capture resolutions.
//! - **[`rectify`]**: per-frame undistortion and perspective warp onto a
//!   configured canvas.
//!
//! ## Typical flow
//!
//! 1. [`calibrate::calibrate_images`] over a set of board photos gives a
//!    [`RadTanModel`]; wrap it with [`GeometryBundle::from_model`].
//! 2. [`HomographyEstimator::estimate`] on the floor-board reference photo
//!    gives the canvas homography; attach it with
//!    [`GeometryBundle::with_homography`] and save the bundle.
//! 3. [`GeometryBundle::rescale`] adapts the bundle to the video resolution.
//! 4. [`FrameRectifier`] turns each video frame into a top-down view.

pub mod board;
pub mod bundle;
pub mod calibrate;
pub mod camera;
pub mod detect;
pub mod homography;
pub mod rectify;

pub use board::BoardSpec;
pub use bundle::{BundleError, GeometryBundle};
pub use calibrate::{CalibrationError, CalibrationOutcome, ReprojectionReport};
pub use camera::{CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use detect::{DetectError, DetectParams, RegionOfInterest, Strategy};
pub use homography::{
    HomographyConfig, HomographyError, HomographyEstimate, HomographyEstimator, RansacOptions,
};
pub use rectify::{FrameRectifier, RectifyConfig, RectifyError};

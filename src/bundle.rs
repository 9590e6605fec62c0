//! The persisted geometry bundle: everything a consumer needs to rectify
//! frames from one camera at one resolution.
//!
//! A bundle is produced in two stages. Calibration fills in the camera
//! matrix and distortion coefficients; the homography workflow adds the
//! image-to-canvas homography and the canvas scale. Every bundle carries the
//! resolution it is valid for, and [`GeometryBundle::rescale`] derives the
//! equivalent bundle for a different capture resolution.

use log::info;
use nalgebra::{DVector, Matrix3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::camera::{Intrinsics, RadTanModel, Resolution};

#[derive(thiserror::Error, Debug)]
pub enum BundleError {
    #[error("Geometry bundle not found at '{path}'; run calibration first")]
    MissingInput { path: String },
    #[error("Failed to read geometry bundle '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Geometry bundle '{path}' is not valid: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },
    #[error(
        "Geometry bundle was built for {expected} but the input is {actual}; \
         rescale the bundle to the input resolution first"
    )]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },
    #[error("Geometry bundle has no homography; run the homography estimation step first")]
    MissingHomography,
    #[error("Invalid target resolution {0}")]
    InvalidResolution(Resolution),
}

/// Calibration products for one camera at one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryBundle {
    /// 3x3 pinhole camera matrix.
    pub camera_matrix: Matrix3<f64>,
    /// Distortion coefficients `[k1, k2, p1, p2, k3]`.
    pub dist_coeff: DVector<f64>,
    /// Image-to-canvas homography, present once estimated.
    pub homography_matrix: Option<Matrix3<f64>>,
    /// Capture resolution the matrices are valid for.
    pub resolution: Resolution,
    /// Canvas pixels per physical unit, present alongside the homography.
    pub pixels_per_unit: Option<f64>,
}

impl GeometryBundle {
    /// Bundle from a calibrated camera model, before any homography exists.
    pub fn from_model(model: &RadTanModel) -> Self {
        GeometryBundle {
            camera_matrix: model.intrinsics.to_matrix(),
            dist_coeff: model.dist_coeffs(),
            homography_matrix: None,
            resolution: model.resolution,
            pixels_per_unit: None,
        }
    }

    /// Reconstructs the camera model the bundle was built from.
    pub fn to_model(&self) -> Result<RadTanModel, crate::camera::CameraModelError> {
        let mut distortions = [0.0; 5];
        for (i, v) in self.dist_coeff.iter().take(5).enumerate() {
            distortions[i] = *v;
        }
        let model = RadTanModel {
            intrinsics: Intrinsics::from_matrix(&self.camera_matrix),
            resolution: self.resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Attaches the estimated homography and its canvas scale.
    pub fn with_homography(mut self, homography: Matrix3<f64>, pixels_per_unit: f64) -> Self {
        self.homography_matrix = Some(homography);
        self.pixels_per_unit = Some(pixels_per_unit);
        self
    }

    /// Loads a bundle from a JSON file. A missing file is reported as
    /// [`BundleError::MissingInput`] so callers can tell "not calibrated
    /// yet" apart from a broken file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BundleError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BundleError::MissingInput { path: display.clone() }
            } else {
                BundleError::Io {
                    path: display.clone(),
                    source: err,
                }
            }
        })?;
        serde_json::from_str(&contents).map_err(|source| BundleError::Malformed {
            path: display,
            source,
        })
    }

    /// Writes the bundle as JSON. Floats round-trip exactly.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BundleError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| BundleError::Malformed {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(path, json).map_err(|source| BundleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        info!("geometry bundle saved to {}", path.display());
        Ok(())
    }

    /// Fails unless the bundle matches the given capture resolution.
    pub fn ensure_resolution(&self, actual: Resolution) -> Result<(), BundleError> {
        if self.resolution == actual {
            Ok(())
        } else {
            Err(BundleError::ResolutionMismatch {
                expected: self.resolution,
                actual,
            })
        }
    }

    /// Derives the equivalent bundle for a different capture resolution.
    ///
    /// With sx = old_width / new_width and sy likewise, the focal lengths
    /// and principal point divide by the scale on their axis, distortion
    /// coefficients carry over unchanged (they act on normalized
    /// coordinates), and the homography is right-multiplied by
    /// diag(sx, sy, 1) so it first lifts new-resolution pixels back to the
    /// old frame. Canvas geometry is untouched.
    ///
    /// A matching target resolution returns an exact copy.
    pub fn rescale(&self, target: Resolution) -> Result<GeometryBundle, BundleError> {
        if target.width == 0 || target.height == 0 {
            return Err(BundleError::InvalidResolution(target));
        }
        if target == self.resolution {
            return Ok(self.clone());
        }

        let sx = self.resolution.width as f64 / target.width as f64;
        let sy = self.resolution.height as f64 / target.height as f64;

        let mut camera_matrix = self.camera_matrix;
        camera_matrix[(0, 0)] /= sx;
        camera_matrix[(0, 2)] /= sx;
        camera_matrix[(1, 1)] /= sy;
        camera_matrix[(1, 2)] /= sy;

        let scale_up = Matrix3::new(
            sx, 0.0, 0.0, //
            0.0, sy, 0.0, //
            0.0, 0.0, 1.0,
        );
        let homography_matrix = self.homography_matrix.map(|h| h * scale_up);

        info!(
            "rescaled geometry bundle {} -> {} (sx {:.4}, sy {:.4})",
            self.resolution, target, sx, sy
        );

        Ok(GeometryBundle {
            camera_matrix,
            dist_coeff: self.dist_coeff.clone(),
            homography_matrix,
            resolution: target,
            pixels_per_unit: self.pixels_per_unit,
        })
    }
}

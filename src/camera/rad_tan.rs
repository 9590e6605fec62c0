//! Radial-tangential (Brown-Conrady) camera model.
//!
//! [`RadTanModel`] combines pinhole intrinsics with the standard 5-term
//! distortion vector `[k1, k2, p1, p2, k3]`. It is the only lens model this
//! pipeline supports: the rig uses a conventional wide-angle dashboard
//! camera, not a fisheye.
//!
//! The forward direction ([`RadTanModel::distort`]) is the closed-form
//! polynomial; the inverse ([`RadTanModel::undistort`]) is solved iteratively
//! with Newton's method and an analytic 2x2 Jacobian.

use crate::camera::{validation, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::YamlLoader;

/// Convergence epsilon for the iterative undistortion.
const UNDISTORT_EPS: f64 = 1e-10;
/// Iteration cap for the iterative undistortion.
const UNDISTORT_MAX_ITERATIONS: u32 = 100;

/// Pinhole camera with radial-tangential distortion.
///
/// The distortion coefficients are stored in OpenCV order:
/// * `k1`, `k2`, `k3`: radial terms.
/// * `p1`, `p2`: tangential terms.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution this model was calibrated at.
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a model from a parameter vector in the order
    /// `fx, fy, cx, cy, k1, k2, p1, p2, k3`, plus the resolution.
    pub fn new(parameters: &DVector<f64>, resolution: Resolution) -> Result<Self, CameraModelError> {
        if parameters.len() != 9 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 9 parameters (fx fy cx cy k1 k2 p1 p2 k3), got {}",
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution,
            distortions: [
                parameters[4],
                parameters[5],
                parameters[6],
                parameters[7],
                parameters[8],
            ],
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Distortion coefficients as a row vector, OpenCV order.
    pub fn dist_coeffs(&self) -> DVector<f64> {
        DVector::from_row_slice(&self.distortions)
    }

    pub fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)
    }

    /// Applies radial and tangential distortion to a normalized image-plane
    /// point (x = X/Z, y = Y/Z).
    pub fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let x = point.x;
        let y = point.y;

        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
        let x_distorted = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let y_distorted = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        Vector2::new(x_distorted, y_distorted)
    }

    /// Inverts [`RadTanModel::distort`] on the normalized image plane.
    ///
    /// Solves for the undistorted point that maps to `distorted` using
    /// Newton's method with the analytic Jacobian of the distortion
    /// polynomial. Converges in a handful of iterations for realistic
    /// coefficients; fails if the Jacobian turns singular.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;

        // Start from the distorted point itself.
        let mut point = *distorted;

        for _ in 0..UNDISTORT_MAX_ITERATIONS {
            let x = point.x;
            let y = point.y;
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;

            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

            let x_est = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let y_est = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            let error = Vector2::new(x_est, y_est) - distorted;

            if error.norm() < UNDISTORT_EPS {
                return Ok(point);
            }

            // d(radial)/dx = (k1 + 2 k2 r^2 + 3 k3 r^4) * 2x, same for y.
            let dr_dx = 2.0 * x;
            let dr_dy = 2.0 * y;
            let d_radial_dx = (k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4) * dr_dx;
            let d_radial_dy = (k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4) * dr_dy;

            let j00 = radial + x * d_radial_dx + 2.0 * p1 * y + p2 * (dr_dx + 4.0 * x);
            let j01 = x * d_radial_dy + 2.0 * p1 * x + p2 * dr_dy;
            let j10 = y * d_radial_dx + p1 * dr_dx + 2.0 * p2 * y;
            let j11 = radial + y * d_radial_dy + p1 * (dr_dy + 4.0 * y) + 2.0 * p2 * x;

            let jacobian = Matrix2::new(j00, j01, j10, j11);
            let inv_jacobian = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })?;

            let delta = inv_jacobian * error;
            point -= delta;

            if delta.norm() < UNDISTORT_EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations",
            UNDISTORT_MAX_ITERATIONS
        )))
    }

    /// Projects a 3D point in camera coordinates to pixel coordinates,
    /// applying distortion. The result may fall outside the image; callers
    /// that care must check bounds themselves.
    pub fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let normalized = Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z);
        let d = self.distort(&normalized);

        Ok(Vector2::new(
            self.intrinsics.fx * d.x + self.intrinsics.cx,
            self.intrinsics.fy * d.y + self.intrinsics.cy,
        ))
    }

    /// Unprojects a pixel to undistorted normalized image-plane coordinates.
    pub fn unproject(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let distorted = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        self.undistort(&distorted)
    }

    /// Computes the optimal new camera matrix for undistortion at alpha = 1:
    /// every source pixel stays visible, at the cost of black borders.
    ///
    /// Border pixels of the distorted image are unprojected to the normalized
    /// plane; the new intrinsics map the bounding box of that set exactly
    /// onto the original resolution.
    pub fn optimal_new_intrinsics(&self) -> Result<Intrinsics, CameraModelError> {
        let w = self.resolution.width as f64;
        let h = self.resolution.height as f64;
        if w < 2.0 || h < 2.0 {
            return Err(CameraModelError::InvalidParams(
                "Resolution must be set before computing a new camera matrix".to_string(),
            ));
        }

        const SAMPLES: usize = 32;
        let mut x_min = f64::INFINITY;
        let mut x_max = f64::NEG_INFINITY;
        let mut y_min = f64::INFINITY;
        let mut y_max = f64::NEG_INFINITY;

        for i in 0..=SAMPLES {
            let t = i as f64 / SAMPLES as f64;
            let border = [
                Vector2::new(t * (w - 1.0), 0.0),
                Vector2::new(t * (w - 1.0), h - 1.0),
                Vector2::new(0.0, t * (h - 1.0)),
                Vector2::new(w - 1.0, t * (h - 1.0)),
            ];
            for pixel in &border {
                let p = self.unproject(pixel)?;
                x_min = x_min.min(p.x);
                x_max = x_max.max(p.x);
                y_min = y_min.min(p.y);
                y_max = y_max.max(p.y);
            }
        }

        if !(x_max > x_min && y_max > y_min) {
            return Err(CameraModelError::NumericalError(
                "Degenerate undistorted extent".to_string(),
            ));
        }

        let fx = (w - 1.0) / (x_max - x_min);
        let fy = (h - 1.0) / (y_max - y_min);
        let new_intrinsics = Intrinsics {
            fx,
            fy,
            cx: -x_min * fx,
            cy: -y_min * fy,
        };
        validation::validate_intrinsics(&new_intrinsics)?;
        Ok(new_intrinsics)
    }

    /// Loads model parameters from a kalibr-style YAML file
    /// (`cam0: {intrinsics, distortion, resolution}`).
    pub fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;

        if docs.is_empty() {
            return Err(CameraModelError::InvalidParams(
                "Empty YAML document".to_string(),
            ));
        }
        let doc = &docs[0];

        let intrinsics_yaml = doc["cam0"]["intrinsics"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid intrinsics".to_string()))?;
        let resolution_yaml = doc["cam0"]["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let distortion_node = doc["cam0"]["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("Missing distortion parameters".to_string())
        })?;

        if intrinsics_yaml.len() != 4 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 4 intrinsic parameters in YAML, found {}",
                intrinsics_yaml.len()
            )));
        }
        if distortion_node.len() != 5 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 5 distortion parameters in YAML, found {}",
                distortion_node.len()
            )));
        }

        let float_at = |node: &yaml_rust::Yaml, name: &str| {
            node.as_f64()
                .or_else(|| node.as_i64().map(|v| v as f64))
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };

        let intrinsics = Intrinsics {
            fx: float_at(&intrinsics_yaml[0], "fx")?,
            fy: float_at(&intrinsics_yaml[1], "fy")?,
            cx: float_at(&intrinsics_yaml[2], "cx")?,
            cy: float_at(&intrinsics_yaml[3], "cy")?,
        };

        let resolution = Resolution {
            width: resolution_yaml[0]
                .as_i64()
                .ok_or_else(|| CameraModelError::InvalidParams("Invalid width".to_string()))?
                as u32,
            height: resolution_yaml[1]
                .as_i64()
                .ok_or_else(|| CameraModelError::InvalidParams("Invalid height".to_string()))?
                as u32,
        };

        let mut distortions = [0.0; 5];
        for (i, param) in distortion_node.iter().enumerate() {
            distortions[i] = float_at(param, &format!("distortion parameter at index {i}"))?;
        }

        let model = RadTanModel {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Saves the model in the same kalibr-style YAML layout that
    /// [`RadTanModel::load_from_yaml`] reads.
    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let cam0 = serde_yaml::Mapping::from_iter([
            (
                serde_yaml::Value::String("camera_model".to_string()),
                serde_yaml::Value::String("rad_tan".to_string()),
            ),
            (
                serde_yaml::Value::String("intrinsics".to_string()),
                serde_yaml::to_value(vec![
                    self.intrinsics.fx,
                    self.intrinsics.fy,
                    self.intrinsics.cx,
                    self.intrinsics.cy,
                ])
                .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
            ),
            (
                serde_yaml::Value::String("distortion".to_string()),
                serde_yaml::to_value(self.distortions.to_vec())
                    .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
            ),
            (
                serde_yaml::Value::String("resolution".to_string()),
                serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                    .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
            ),
        ]);
        let root = serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::Value::Mapping(cam0),
        )]);

        let yaml_string = serde_yaml::to_string(&serde_yaml::Value::Mapping(root))
            .map_err(|e| CameraModelError::YamlError(e.to_string()))?;

        let mut file =
            fs::File::create(path).map_err(|e| CameraModelError::IOError(e.to_string()))?;
        file.write_all(yaml_string.as_bytes())
            .map_err(|e| CameraModelError::IOError(e.to_string()))?;

        Ok(())
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} resolution: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.resolution,
            self.distortions,
        )
    }
}

//! Joint Levenberg-Marquardt refinement of camera intrinsics and per-view
//! board poses.
//!
//! One shared 9-element camera variable (fx, fy, cx, cy, k1, k2, p1, p2, k3)
//! is optimized together with a 6-element axis-angle + translation pose per
//! view. Each view contributes one residual block of 2N reprojection errors
//! through a generic cost functor so `tiny_solver` can apply automatic
//! differentiation.

use log::info;
use nalgebra::{DVector, Point2, Point3, Vector3};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::board::CheckerboardObservation;
use crate::camera::CameraModelError;

/// Reprojection residual for one calibration view.
///
/// Parameter layout: `params[0]` is the shared camera vector, `params[1]`
/// is this view's pose (axis-angle rotation, then translation).
#[derive(Debug, Clone)]
struct ViewReprojectionCost {
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl ViewReprojectionCost {
    fn new(observation: &CheckerboardObservation) -> Self {
        Self {
            object_points: observation.object_points.clone(),
            image_points: observation.image_points.clone(),
        }
    }
}

/// Rodrigues rotation of `p` by the axis-angle vector `omega`, generic over
/// the scalar so dual numbers flow through.
fn rodrigues_rotate<T: nalgebra::RealField>(omega: &Vector3<T>, p: &Vector3<T>) -> Vector3<T> {
    let theta2 = omega.dot(omega);
    let small = T::from_f64(1e-14).unwrap();
    if theta2 < small {
        // First-order expansion near zero rotation.
        return p + omega.cross(p);
    }
    let theta = theta2.clone().sqrt();
    let axis = omega / theta.clone();
    let cos_t = theta.clone().cos();
    let sin_t = theta.sin();
    let one = T::from_f64(1.0).unwrap();

    p * cos_t.clone() + axis.cross(p) * sin_t + &axis * (axis.dot(p) * (one - cos_t))
}

impl<T: nalgebra::RealField> Factor<T> for ViewReprojectionCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let cam = &params[0];
        let pose = &params[1];

        let fx = cam[0].clone();
        let fy = cam[1].clone();
        let cx = cam[2].clone();
        let cy = cam[3].clone();
        let k1 = cam[4].clone();
        let k2 = cam[5].clone();
        let p1 = cam[6].clone();
        let p2 = cam[7].clone();
        let k3 = cam[8].clone();

        let omega = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let translation = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());

        let one = T::from_f64(1.0).unwrap();
        let two = T::from_f64(2.0).unwrap();
        let min_depth = T::from_f64(1e-6).unwrap();
        let penalty = T::from_f64(1e6).unwrap();

        let mut residuals = DVector::zeros(self.image_points.len() * 2);

        for i in 0..self.image_points.len() {
            let obj = &self.object_points[i];
            let obs = &self.image_points[i];

            let board_point = Vector3::new(
                T::from_f64(obj.x).unwrap(),
                T::from_f64(obj.y).unwrap(),
                T::from_f64(obj.z).unwrap(),
            );
            let cam_point = rodrigues_rotate(&omega, &board_point) + translation.clone();

            if cam_point.z < min_depth {
                residuals[i * 2] = penalty.clone();
                residuals[i * 2 + 1] = penalty.clone();
                continue;
            }

            let x = cam_point.x.clone() / cam_point.z.clone();
            let y = cam_point.y.clone() / cam_point.z.clone();

            let r2 = x.clone() * x.clone() + y.clone() * y.clone();
            let r4 = r2.clone() * r2.clone();
            let r6 = r4.clone() * r2.clone();
            let radial = one.clone() + k1.clone() * r2.clone() + k2.clone() * r4 + k3.clone() * r6;

            let xd = x.clone() * radial.clone()
                + two.clone() * p1.clone() * x.clone() * y.clone()
                + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
            let yd = y.clone() * radial
                + p1.clone() * (r2.clone() + two.clone() * y.clone() * y.clone())
                + two.clone() * p2.clone() * x.clone() * y.clone();

            let u = fx.clone() * xd + cx.clone();
            let v = fy.clone() * yd + cy.clone();

            residuals[i * 2] = u - T::from_f64(obs.x).unwrap();
            residuals[i * 2 + 1] = v - T::from_f64(obs.y).unwrap();
        }

        residuals
    }
}

/// Initial pose of one view, axis-angle + translation.
#[derive(Debug, Clone)]
pub struct ViewPose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl ViewPose {
    fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ])
    }

    /// Transforms a board-plane point into camera coordinates.
    pub fn transform(&self, p: &Point3<f64>) -> Vector3<f64> {
        rodrigues_rotate(&self.rotation, &p.coords) + self.translation
    }
}

/// Jointly refines the 9 camera parameters and all view poses. Returns the
/// refined camera vector and poses in view order.
pub fn refine(
    camera_params: &DVector<f64>,
    poses: &[ViewPose],
    observations: &[CheckerboardObservation],
) -> Result<(DVector<f64>, Vec<ViewPose>), CameraModelError> {
    if poses.len() != observations.len() {
        return Err(CameraModelError::InvalidParams(
            "One pose per observation is required".to_string(),
        ));
    }
    if observations.is_empty() {
        return Err(CameraModelError::InvalidParams(
            "Observations cannot be empty".to_string(),
        ));
    }

    let mut problem = tiny_solver::Problem::new();
    let mut initial_values = HashMap::new();
    initial_values.insert("cam".to_string(), camera_params.clone());

    for (i, (pose, observation)) in poses.iter().zip(observations.iter()).enumerate() {
        let pose_key = format!("pose/{i}");
        let cost = ViewReprojectionCost::new(observation);
        let num_residuals = observation.len() * 2;
        problem.add_residual_block(
            num_residuals,
            &["cam", pose_key.as_str()],
            Box::new(cost),
            None,
        );
        initial_values.insert(pose_key, pose.to_vector());
    }

    info!(
        "refining intrinsics over {} views ({} corners total)",
        observations.len(),
        observations.iter().map(|o| o.len()).sum::<usize>()
    );

    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer
        .optimize(&problem, &initial_values, None)
        .ok_or_else(|| CameraModelError::NumericalError("Optimization failed".to_string()))?;

    let refined_cam = result
        .get("cam")
        .ok_or_else(|| {
            CameraModelError::NumericalError("Optimizer dropped the camera variable".to_string())
        })?
        .clone();

    let mut refined_poses = Vec::with_capacity(poses.len());
    for i in 0..poses.len() {
        let pose_vec = result.get(&format!("pose/{i}")).ok_or_else(|| {
            CameraModelError::NumericalError(format!("Optimizer dropped pose {i}"))
        })?;
        refined_poses.push(ViewPose {
            rotation: Vector3::new(pose_vec[0], pose_vec[1], pose_vec[2]),
            translation: Vector3::new(pose_vec[3], pose_vec[4], pose_vec[5]),
        });
    }

    Ok((refined_cam, refined_poses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rodrigues_matches_quarter_turn() {
        let omega = Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let p = Vector3::new(1.0, 0.0, 0.0);
        let r = rodrigues_rotate(&omega, &p);
        assert_relative_eq!(r.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(r.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(r.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rodrigues_near_zero_is_stable() {
        let omega = Vector3::new(1e-9, -1e-9, 1e-9);
        let p = Vector3::new(0.3, 0.4, 1.0);
        let r = rodrigues_rotate(&omega, &p);
        assert_relative_eq!(r.x, p.x, epsilon = 1e-8);
        assert_relative_eq!(r.y, p.y, epsilon = 1e-8);
        assert_relative_eq!(r.z, p.z, epsilon = 1e-8);
    }

    #[test]
    fn residual_is_zero_for_perfect_parameters() {
        let cam = DVector::from_vec(vec![
            800.0, 810.0, 320.0, 240.0, -0.2, 0.05, 0.001, -0.0005, 0.0,
        ]);
        let pose = ViewPose {
            rotation: Vector3::new(0.1, -0.05, 0.02),
            translation: Vector3::new(-3.0, 1.0, 40.0),
        };

        let board = crate::board::BoardSpec {
            cols: 4,
            rows: 3,
            square_size: 3.86,
        };
        let object_points = board.object_points();
        let image_points: Vec<Point2<f64>> = object_points
            .iter()
            .map(|obj| {
                let c = pose.transform(obj);
                let x = c.x / c.z;
                let y = c.y / c.z;
                let r2 = x * x + y * y;
                let radial = 1.0 - 0.2 * r2 + 0.05 * r2 * r2;
                let xd = x * radial + 2.0 * 0.001 * x * y - 0.0005 * (r2 + 2.0 * x * x);
                let yd = y * radial + 0.001 * (r2 + 2.0 * y * y) - 2.0 * 0.0005 * x * y;
                Point2::new(800.0 * xd + 320.0, 810.0 * yd + 240.0)
            })
            .collect();

        let cost = ViewReprojectionCost {
            object_points,
            image_points,
        };
        let residuals: DVector<f64> = cost.residual_func(&[cam, pose.to_vector()]);
        for r in residuals.iter() {
            assert_relative_eq!(*r, 0.0, epsilon = 1e-9);
        }
    }
}

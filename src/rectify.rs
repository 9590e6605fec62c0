//! Lens undistortion and perspective warping of camera frames.
//!
//! Both operations are expressed as inverse maps: for every output pixel,
//! compute where it comes from in the input and sample bilinearly. The
//! undistortion map depends only on the camera model and is precomputed
//! once, which is what makes per-frame rectification cheap.

use image::{Rgb, RgbImage};
use log::info;
use nalgebra::{Matrix3, Vector2, Vector3};

use crate::bundle::{BundleError, GeometryBundle};
use crate::camera::{CameraModelError, Intrinsics, RadTanModel, Resolution};

#[derive(thiserror::Error, Debug)]
pub enum RectifyError {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    CameraModel(#[from] CameraModelError),
    #[error("Homography is not invertible")]
    NonInvertibleHomography,
}

/// Per-pixel source coordinates for an inverse remap. A negative coordinate
/// marks "outside the source image".
struct RemapTable {
    width: u32,
    height: u32,
    source: Vec<(f32, f32)>,
}

impl RemapTable {
    fn apply(&self, input: &RgbImage) -> RgbImage {
        let mut output = RgbImage::new(self.width, self.height);
        for (index, pixel) in output.pixels_mut().enumerate() {
            let (sx, sy) = self.source[index];
            *pixel = sample_rgb(input, sx as f64, sy as f64);
        }
        output
    }
}

/// Bilinear RGB sample; pixels outside the image come back black, matching
/// a constant-border remap.
fn sample_rgb(image: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f64 || y > (height - 1) as f64 {
        return Rgb([0, 0, 0]);
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let p00 = image.get_pixel(x0, y0).0[c] as f64;
        let p10 = image.get_pixel(x1, y0).0[c] as f64;
        let p01 = image.get_pixel(x0, y1).0[c] as f64;
        let p11 = image.get_pixel(x1, y1).0[c] as f64;
        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Builds the inverse undistortion map: for every pixel of the undistorted
/// output (under `new_intrinsics`), the distorted source pixel it samples.
fn build_undistort_map(model: &RadTanModel, new_intrinsics: &Intrinsics) -> RemapTable {
    let Resolution { width, height } = model.resolution;
    let mut source = Vec::with_capacity((width * height) as usize);

    for v in 0..height {
        for u in 0..width {
            let x = (u as f64 - new_intrinsics.cx) / new_intrinsics.fx;
            let y = (v as f64 - new_intrinsics.cy) / new_intrinsics.fy;
            let d = model.distort(&Vector2::new(x, y));
            let sx = model.intrinsics.fx * d.x + model.intrinsics.cx;
            let sy = model.intrinsics.fy * d.y + model.intrinsics.cy;
            source.push((sx as f32, sy as f32));
        }
    }

    RemapTable {
        width,
        height,
        source,
    }
}

/// Undistorts an image so straight lines in the world come out straight,
/// rendered under `new_intrinsics` at the model's resolution.
pub fn undistort_image(
    image: &RgbImage,
    model: &RadTanModel,
    new_intrinsics: &Intrinsics,
) -> Result<RgbImage, CameraModelError> {
    crate::camera::validation::validate_intrinsics(new_intrinsics)?;
    Ok(build_undistort_map(model, new_intrinsics).apply(image))
}

/// Warps `image` through `homography` onto a `width` x `height` canvas by
/// inverse mapping.
pub fn warp_perspective(
    image: &RgbImage,
    homography: &Matrix3<f64>,
    width: u32,
    height: u32,
) -> Result<RgbImage, RectifyError> {
    let inverse = homography
        .try_inverse()
        .ok_or(RectifyError::NonInvertibleHomography)?;

    let mut output = RgbImage::new(width, height);
    for (u, v, pixel) in output.enumerate_pixels_mut() {
        let q = inverse * Vector3::new(u as f64, v as f64, 1.0);
        if q.z.abs() < f64::EPSILON {
            continue;
        }
        *pixel = sample_rgb(image, q.x / q.z, q.y / q.z);
    }
    Ok(output)
}

/// Output canvas geometry for rectified frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectifyConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Translation pre-multiplied into the homography so the scene of
    /// interest lands on the canvas.
    pub shift_x: f64,
    pub shift_y: f64,
}

impl Default for RectifyConfig {
    fn default() -> Self {
        RectifyConfig {
            canvas_width: 2000,
            canvas_height: 2000,
            shift_x: 750.0,
            shift_y: 0.0,
        }
    }
}

/// Turns raw camera frames into top-down views using a geometry bundle.
///
/// Construction precomputes the undistortion map and folds the configured
/// canvas shift into the homography; after that, rectification is a pure
/// per-frame function. Frames are undistorted with the bundle's own camera
/// matrix as the output intrinsics, which is exactly the geometry the
/// homography was estimated against.
pub struct FrameRectifier {
    resolution: Resolution,
    undistort_map: RemapTable,
    shifted_homography: Matrix3<f64>,
    config: RectifyConfig,
}

impl FrameRectifier {
    pub fn new(bundle: &GeometryBundle, config: RectifyConfig) -> Result<Self, RectifyError> {
        let homography = bundle
            .homography_matrix
            .ok_or(BundleError::MissingHomography)?;
        let model = bundle.to_model()?;

        let shift = Matrix3::new(
            1.0, 0.0, config.shift_x, //
            0.0, 1.0, config.shift_y, //
            0.0, 0.0, 1.0,
        );
        let shifted_homography = shift * homography;
        // Fail fast if the warp cannot be inverted at all.
        shifted_homography
            .try_inverse()
            .ok_or(RectifyError::NonInvertibleHomography)?;

        let undistort_map = build_undistort_map(&model, &model.intrinsics);
        info!(
            "frame rectifier ready: {} -> {}x{} canvas, shift ({}, {})",
            model.resolution, config.canvas_width, config.canvas_height, config.shift_x, config.shift_y
        );

        Ok(FrameRectifier {
            resolution: model.resolution,
            undistort_map,
            shifted_homography,
            config,
        })
    }

    /// Undistorts and warps one frame onto the configured canvas.
    pub fn rectify(&self, frame: &RgbImage) -> Result<RgbImage, RectifyError> {
        let actual = Resolution {
            width: frame.width(),
            height: frame.height(),
        };
        if actual != self.resolution {
            return Err(BundleError::ResolutionMismatch {
                expected: self.resolution,
                actual,
            }
            .into());
        }

        let undistorted = self.undistort_map.apply(frame);
        warp_perspective(
            &undistorted,
            &self.shifted_homography,
            self.config.canvas_width,
            self.config.canvas_height,
        )
    }
}

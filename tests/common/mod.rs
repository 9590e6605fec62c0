//! Synthetic checkerboard scenes rendered through a camera model.
//!
//! The renderer is exact inverse rendering: every output pixel is
//! unprojected through the lens model to a viewing ray, the ray is
//! intersected with the board plane, and the hit point decides the checker
//! shade. 2x2 supersampling gives the soft edges the sub-pixel refiner
//! needs.

use birdseye_tools::{BoardSpec, RadTanModel};
use image::{GrayImage, Luma, RgbImage};
use nalgebra::{Point2, Rotation3, Vector2, Vector3};

const DARK: f64 = 25.0;
const LIGHT: f64 = 230.0;
const BACKGROUND: f64 = 180.0;

/// A checkerboard at a rigid pose in front of a camera.
pub struct BoardScene {
    pub model: RadTanModel,
    pub board: BoardSpec,
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl BoardScene {
    pub fn new(
        model: RadTanModel,
        board: BoardSpec,
        axis_angle: Vector3<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        BoardScene {
            model,
            board,
            rotation: Rotation3::new(axis_angle),
            translation,
        }
    }

    /// Exact pixel position of inner corner (row `i`, column `j`).
    pub fn corner_pixel(&self, i: usize, j: usize) -> Point2<f64> {
        let board_point = Vector3::new(
            j as f64 * self.board.square_size,
            i as f64 * self.board.square_size,
            0.0,
        );
        let cam_point = self.rotation * board_point + self.translation;
        let pixel = self.model.project(&cam_point).expect("corner behind camera");
        Point2::new(pixel.x, pixel.y)
    }

    /// Shade of the board plane at a viewing ray, or the background shade
    /// when the ray misses the board.
    fn shade_along_ray(&self, ray: Vector3<f64>) -> f64 {
        let r_inv = self.rotation.inverse();
        let d = r_inv * ray;
        let t = r_inv * self.translation;
        if d.z.abs() < 1e-12 {
            return BACKGROUND;
        }
        let lambda = t.z / d.z;
        if lambda <= 0.0 {
            return BACKGROUND;
        }
        let hit = d * lambda - t;

        let s = self.board.square_size;
        let min = -s;
        let max_x = self.board.cols as f64 * s;
        let max_y = self.board.rows as f64 * s;
        if hit.x < min || hit.x > max_x || hit.y < min || hit.y > max_y {
            return BACKGROUND;
        }
        let ix = ((hit.x + s) / s).floor() as i64;
        let iy = ((hit.y + s) / s).floor() as i64;
        if (ix + iy) % 2 == 0 {
            DARK
        } else {
            LIGHT
        }
    }

    /// Renders the scene as seen through the (possibly distorting) lens.
    pub fn render_gray(&self) -> GrayImage {
        let width = self.model.resolution.width;
        let height = self.model.resolution.height;

        GrayImage::from_fn(width, height, |u, v| {
            let mut acc = 0.0;
            for (du, dv) in [(-0.25, -0.25), (0.25, -0.25), (-0.25, 0.25), (0.25, 0.25)] {
                let pixel = Vector2::new(u as f64 + du, v as f64 + dv);
                let shade = match self.model.unproject(&pixel) {
                    Ok(n) => self.shade_along_ray(Vector3::new(n.x, n.y, 1.0)),
                    Err(_) => BACKGROUND,
                };
                acc += shade;
            }
            Luma([(acc / 4.0).round() as u8])
        })
    }

    pub fn render_rgb(&self) -> RgbImage {
        image::DynamicImage::ImageLuma8(self.render_gray()).into_rgb8()
    }
}

//! Iterative sub-pixel corner refinement.
//!
//! Classic gradient-orthogonality scheme: for every pixel q in a window
//! around the corner, the image gradient at q is orthogonal to (q - c) when
//! c is the true saddle point. Accumulating the weighted normal equations
//! over the window and solving the 2x2 system moves the estimate toward
//! that point; a few iterations converge well below a tenth of a pixel.

use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};

/// Half-size of the refinement window (full window 11x11).
const HALF_WINDOW: i32 = 5;
/// Iteration cap, after which the last estimate is returned as-is.
const MAX_ITERATIONS: u32 = 30;
/// Convergence threshold on the per-iteration shift, in pixels.
const EPSILON: f64 = 1e-3;

/// Refines `corner` to sub-pixel accuracy on `image`. Estimates that drift
/// out of the image or diverge past the window are snapped back to the
/// initial guess.
pub fn refine_corner(image: &GrayImage, corner: Point2<f64>) -> Point2<f64> {
    let (width, height) = image.dimensions();
    let margin = (HALF_WINDOW + 1) as f64;
    let in_bounds = |p: &Point2<f64>| {
        p.x >= margin && p.y >= margin && p.x < width as f64 - margin && p.y < height as f64 - margin
    };
    if !in_bounds(&corner) {
        return corner;
    }

    // Gaussian window weights, sigma tied to the window size.
    let sigma = HALF_WINDOW as f64 / 2.0;
    let mut center = corner;

    for _ in 0..MAX_ITERATIONS {
        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();

        for dy in -HALF_WINDOW..=HALF_WINDOW {
            for dx in -HALF_WINDOW..=HALF_WINDOW {
                let px = center.x + dx as f64;
                let py = center.y + dy as f64;

                // Central differences on bilinearly sampled intensities.
                let gx = (sample(image, px + 1.0, py) - sample(image, px - 1.0, py)) / 2.0;
                let gy = (sample(image, px, py + 1.0) - sample(image, px, py - 1.0)) / 2.0;

                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude < 1e-9 {
                    continue;
                }

                // Normalize the outer product by the gradient magnitude:
                // squared-gradient weights over-count the steepest samples
                // of a hard edge and drag the solution off the true edge
                // line.
                let w = (-(dx * dx + dy * dy) as f64 / (2.0 * sigma * sigma)).exp() / magnitude;
                let gxx = w * gx * gx;
                let gxy = w * gx * gy;
                let gyy = w * gy * gy;

                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 0)] += gxy;
                a[(1, 1)] += gyy;
                b.x += gxx * px + gxy * py;
                b.y += gxy * px + gyy * py;
            }
        }

        let Some(inv) = a.try_inverse() else {
            return center;
        };
        let solved = inv * b;
        let next = Point2::new(solved.x, solved.y);
        let shift = (next - center).norm();

        if !in_bounds(&next) || (next - corner).norm() > 2.0 * HALF_WINDOW as f64 {
            return corner;
        }
        center = next;
        if shift < EPSILON {
            break;
        }
    }

    center
}

/// Bilinear intensity sample, clamped at the image border.
pub(crate) fn sample(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (width, height) = image.dimensions();
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p = |xx: u32, yy: u32| image.get_pixel(xx, yy).0[0] as f64;
    let top = p(x0, y0) * (1.0 - fx) + p(x1, y0) * fx;
    let bottom = p(x0, y1) * (1.0 - fx) + p(x1, y1) * fx;
    top * (1.0 - fy) + bottom * fy
}

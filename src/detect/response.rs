//! Ring-difference corner response for checkerboard inner corners.
//!
//! At an ideal inner corner a circle around the corner crosses four
//! black/white transitions: samples a quarter turn apart differ, samples half
//! a turn apart match. The response below rewards exactly that pattern and
//! penalizes edges (strong half-turn difference) and plain bright or dark
//! blobs (ring far from the local mean).

use image::GrayImage;
use nalgebra::Point2;

/// 16 samples on a radius-5 ring, in angular order.
const RING: [(i32, i32); 16] = [
    (5, 0),
    (5, 2),
    (4, 4),
    (2, 5),
    (0, 5),
    (-2, 5),
    (-4, 4),
    (-5, 2),
    (-5, 0),
    (-5, -2),
    (-4, -4),
    (-2, -5),
    (0, -5),
    (2, -5),
    (4, -4),
    (5, -2),
];

const RING_RADIUS: u32 = 5;

/// A local maximum of the corner response map.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub position: Point2<f64>,
    pub response: f32,
}

/// Computes the corner response at every pixel far enough from the border
/// for the sampling ring to fit. Pixels inside the border margin get 0.
pub fn response_map(image: &GrayImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let mut map = vec![0.0f32; (width * height) as usize];
    if width <= 2 * RING_RADIUS || height <= 2 * RING_RADIUS {
        return map;
    }

    let luma = |x: i32, y: i32| image.get_pixel(x as u32, y as u32).0[0] as f32;

    for y in RING_RADIUS..height - RING_RADIUS {
        for x in RING_RADIUS..width - RING_RADIUS {
            let xi = x as i32;
            let yi = y as i32;

            let mut s = [0.0f32; 16];
            for (i, (dx, dy)) in RING.iter().enumerate() {
                s[i] = luma(xi + dx, yi + dy);
            }

            // Quarter-turn alternation: large at a corner.
            let mut sum_response = 0.0f32;
            for i in 0..4 {
                sum_response += (s[i] - s[i + 4] + s[i + 8] - s[i + 12]).abs();
            }

            // Half-turn difference: large on an edge, small at a corner.
            let mut diff_response = 0.0f32;
            for i in 0..8 {
                diff_response += (s[i] - s[i + 8]).abs();
            }

            // Ring-vs-center deviation rejects blobs and flat patches.
            let ring_sum: f32 = s.iter().sum();
            let mut local = 0.0f32;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    local += luma(xi + dx, yi + dy);
                }
            }
            let mean_response = (ring_sum - 16.0 * local / 9.0).abs();

            map[(y * width + x) as usize] = sum_response - diff_response - mean_response;
        }
    }

    map
}

/// Extracts local maxima of the response map that exceed
/// `relative_threshold` times the global maximum.
pub fn extract_candidates(
    map: &[f32],
    width: u32,
    height: u32,
    nms_radius: u32,
    relative_threshold: f32,
) -> Vec<Candidate> {
    let max_response = map.iter().cloned().fold(0.0f32, f32::max);
    if max_response <= 0.0 {
        return Vec::new();
    }
    let threshold = relative_threshold * max_response;

    let at = |x: u32, y: u32| map[(y * width + x) as usize];
    let r = nms_radius as i32;

    let mut candidates = Vec::new();
    for y in nms_radius..height.saturating_sub(nms_radius) {
        for x in nms_radius..width.saturating_sub(nms_radius) {
            let v = at(x, y);
            if v < threshold {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -r..=r {
                for dx in -r..=r {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as i32 + dx) as u32;
                    let ny = (y as i32 + dy) as u32;
                    // Strict on one side so plateau twins cannot both pass.
                    let n = at(nx, ny);
                    if n > v || (n == v && (dy < 0 || (dy == 0 && dx < 0))) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                candidates.push(Candidate {
                    position: Point2::new(x as f64, y as f64),
                    response: v,
                });
            }
        }
    }

    candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
    candidates
}

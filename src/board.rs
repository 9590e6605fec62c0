//! Planar checkerboard target geometry.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// Physical description of a checkerboard calibration target.
///
/// `cols` and `rows` count the *inner* corners (one less than the number of
/// squares along each axis). `square_size` is the side length of one square
/// in whatever physical unit the caller works in; the default target measures
/// 3.86 cm per square.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    /// Inner corners along the horizontal axis.
    pub cols: usize,
    /// Inner corners along the vertical axis.
    pub rows: usize,
    /// Physical side length of one square.
    pub square_size: f64,
}

impl Default for BoardSpec {
    fn default() -> Self {
        BoardSpec {
            cols: 9,
            rows: 6,
            square_size: 3.86,
        }
    }
}

impl BoardSpec {
    /// Total number of inner corners.
    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Ideal corner positions on the board plane (Z = 0), row-major:
    /// index `i * cols + j` is column `j` of row `i`, at
    /// `(j * square_size, i * square_size, 0)`.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(self.corner_count());
        for i in 0..self.rows {
            for j in 0..self.cols {
                points.push(Point3::new(
                    j as f64 * self.square_size,
                    i as f64 * self.square_size,
                    0.0,
                ));
            }
        }
        points
    }
}

/// A detected board in one image: sub-pixel corner locations paired
/// index-for-index with the ideal board-plane points.
#[derive(Debug, Clone)]
pub struct CheckerboardObservation {
    /// Detected corners in pixel coordinates, row-major board order.
    pub image_points: Vec<Point2<f64>>,
    /// Matching ideal corners on the board plane.
    pub object_points: Vec<Point3<f64>>,
}

impl CheckerboardObservation {
    pub fn new(image_points: Vec<Point2<f64>>, board: &BoardSpec) -> Self {
        debug_assert_eq!(image_points.len(), board.corner_count());
        CheckerboardObservation {
            image_points,
            object_points: board.object_points(),
        }
    }

    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_points_are_row_major() {
        let board = BoardSpec {
            cols: 4,
            rows: 3,
            square_size: 2.0,
        };
        let points = board.object_points();
        assert_eq!(points.len(), 12);
        // First row runs along x.
        assert_eq!(points[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(points[3], Point3::new(6.0, 0.0, 0.0));
        // Second row starts one square down.
        assert_eq!(points[4], Point3::new(0.0, 2.0, 0.0));
        // Last corner.
        assert_eq!(points[11], Point3::new(6.0, 4.0, 0.0));
    }

    #[test]
    fn default_board_matches_target_in_use() {
        let board = BoardSpec::default();
        assert_eq!(board.cols, 9);
        assert_eq!(board.rows, 6);
        assert_eq!(board.corner_count(), 54);
    }
}

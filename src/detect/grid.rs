//! Ordering corner candidates into a row-major (cols x rows) lattice.
//!
//! The candidate set from the response stage is unordered and may contain
//! extras (texture, board border). This module recovers the board grid:
//! rotate the points so the board rows run horizontally, cluster by the
//! rotated y coordinate, pick the most evenly spaced run of `cols` points in
//! each row, and validate the spacing statistics. Anything that does not
//! form a clean lattice is rejected so the caller can try the next
//! detection strategy.

use nalgebra::{Point2, Rotation2};

use crate::detect::response::Candidate;

/// Maximum allowed coefficient of variation of in-row corner spacing.
const MAX_SPACING_CV: f64 = 0.35;

/// Attempts to order `candidates` into a row-major `cols` x `rows` grid.
/// Returns the ordered points in the original image frame, or `None` when
/// the candidates do not form a valid lattice.
pub fn order_into_grid(candidates: &[Candidate], cols: usize, rows: usize) -> Option<Vec<Point2<f64>>> {
    let expected = cols * rows;
    if candidates.len() < expected || cols < 2 || rows < 2 {
        return None;
    }

    // Keep the strongest responses; a moderate surplus is tolerated, a large
    // one means the scene is cluttered and row clustering becomes guesswork.
    let limit = (expected + expected / 2).min(candidates.len());
    let points: Vec<Point2<f64>> = candidates[..limit].iter().map(|c| c.position).collect();

    let spacing = median_nearest_neighbor_distance(&points)?;
    let angle = dominant_orientation(&points, spacing)?;
    let rotation = Rotation2::new(-angle);
    let rotated: Vec<Point2<f64>> = points.iter().map(|p| rotation * p).collect();

    // Cluster by rotated y. A gap larger than half the lattice spacing
    // starts a new row.
    let mut order: Vec<usize> = (0..rotated.len()).collect();
    order.sort_by(|&a, &b| rotated[a].y.total_cmp(&rotated[b].y));

    let mut row_clusters: Vec<Vec<usize>> = Vec::new();
    for &idx in &order {
        match row_clusters.last_mut() {
            Some(row) => {
                let last_y = rotated[*row.last().unwrap()].y;
                if rotated[idx].y - last_y > 0.5 * spacing {
                    row_clusters.push(vec![idx]);
                } else {
                    row.push(idx);
                }
            }
            None => row_clusters.push(vec![idx]),
        }
    }

    // Drop rows that are clearly noise (too few members to be a board row).
    row_clusters.retain(|row| row.len() >= cols);
    if row_clusters.len() != rows {
        return None;
    }

    let mut grid = Vec::with_capacity(expected);
    for row in &mut row_clusters {
        row.sort_by(|&a, &b| rotated[a].x.total_cmp(&rotated[b].x));
        let selected = select_uniform_run(row, &rotated, cols)?;
        for idx in selected {
            grid.push(points[idx]);
        }
    }

    validate_lattice(&grid, cols, rows).then_some(grid)
}

/// Median distance from each point to its nearest neighbor. Estimates the
/// lattice spacing without knowing the grid yet.
fn median_nearest_neighbor_distance(points: &[Point2<f64>]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let mut distances: Vec<f64> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            points
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, q)| (p - q).norm())
                .fold(f64::INFINITY, f64::min)
        })
        .collect();
    distances.sort_by(f64::total_cmp);
    let median = distances[distances.len() / 2];
    (median.is_finite() && median > 1.0).then_some(median)
}

/// Dominant lattice direction, folded into (-45, 45] degrees.
///
/// Nearest-neighbor vectors of a checkerboard lattice point along the two
/// board axes; folding modulo 90 degrees merges them into one direction.
fn dominant_orientation(points: &[Point2<f64>], spacing: f64) -> Option<f64> {
    let quarter = std::f64::consts::FRAC_PI_2;
    let mut angles = Vec::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        let mut best = None::<(f64, f64)>;
        for (j, q) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            let d = q - p;
            let dist = d.norm();
            if dist > 1.6 * spacing {
                continue;
            }
            if best.map_or(true, |(b, _)| dist < b) {
                best = Some((dist, d.y.atan2(d.x)));
            }
        }
        if let Some((_, a)) = best {
            let mut folded = a % quarter;
            if folded > quarter / 2.0 {
                folded -= quarter;
            } else if folded < -quarter / 2.0 {
                folded += quarter;
            }
            angles.push(folded);
        }
    }
    if angles.is_empty() {
        return None;
    }
    angles.sort_by(f64::total_cmp);
    Some(angles[angles.len() / 2])
}

/// Picks the contiguous run of `cols` points with the most uniform spacing.
fn select_uniform_run(row: &[usize], rotated: &[Point2<f64>], cols: usize) -> Option<Vec<usize>> {
    if row.len() < cols {
        return None;
    }
    if row.len() == cols {
        return Some(row.to_vec());
    }
    let mut best: Option<(f64, usize)> = None;
    for start in 0..=row.len() - cols {
        let window = &row[start..start + cols];
        let gaps: Vec<f64> = window
            .windows(2)
            .map(|w| rotated[w[1]].x - rotated[w[0]].x)
            .collect();
        let cv = coefficient_of_variation(&gaps)?;
        if best.map_or(true, |(b, _)| cv < b) {
            best = Some((cv, start));
        }
    }
    best.map(|(_, start)| row[start..start + cols].to_vec())
}

fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n;
    if mean.abs() < f64::EPSILON {
        return None;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt() / mean.abs())
}

/// Checks that the ordered grid really looks like a board: uniform spacing
/// within every row and column, consistent row direction.
fn validate_lattice(grid: &[Point2<f64>], cols: usize, rows: usize) -> bool {
    if grid.len() != cols * rows {
        return false;
    }

    for r in 0..rows {
        let gaps: Vec<f64> = (0..cols - 1)
            .map(|c| (grid[r * cols + c + 1] - grid[r * cols + c]).norm())
            .collect();
        match coefficient_of_variation(&gaps) {
            Some(cv) if cv <= MAX_SPACING_CV => {}
            _ => return false,
        }
    }
    for c in 0..cols {
        let gaps: Vec<f64> = (0..rows - 1)
            .map(|r| (grid[(r + 1) * cols + c] - grid[r * cols + c]).norm())
            .collect();
        match coefficient_of_variation(&gaps) {
            Some(cv) if cv <= MAX_SPACING_CV => {}
            _ => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn lattice_candidates(cols: usize, rows: usize, spacing: f64, angle: f64) -> Vec<Candidate> {
        let rotation = Rotation2::new(angle);
        let mut candidates = Vec::new();
        for i in 0..rows {
            for j in 0..cols {
                let p = Point2::new(100.0 + j as f64 * spacing, 80.0 + i as f64 * spacing);
                candidates.push(Candidate {
                    position: rotation * p,
                    response: 1.0,
                });
            }
        }
        candidates
    }

    #[test]
    fn axis_aligned_grid_is_recovered_in_row_major_order() {
        let mut candidates = lattice_candidates(5, 4, 30.0, 0.0);
        // Shuffle deterministically.
        candidates.reverse();
        candidates.swap(3, 11);

        let grid = order_into_grid(&candidates, 5, 4).expect("grid");
        assert_eq!(grid.len(), 20);
        assert_relative_eq!(grid[0].x, 100.0, epsilon = 1e-9);
        assert_relative_eq!(grid[0].y, 80.0, epsilon = 1e-9);
        assert_relative_eq!(grid[4].x, 220.0, epsilon = 1e-9);
        assert_relative_eq!(grid[5].y, 110.0, epsilon = 1e-9);
    }

    #[test]
    fn tilted_grid_is_recovered() {
        let candidates = lattice_candidates(6, 5, 25.0, 0.15);
        let grid = order_into_grid(&candidates, 6, 5).expect("grid");
        assert_eq!(grid.len(), 30);
        // Row-major ordering survives the tilt: consecutive in-row gaps stay
        // close to the lattice spacing.
        for r in 0..5 {
            for c in 0..5 {
                let gap = (grid[r * 6 + c + 1] - grid[r * 6 + c]).norm();
                assert_relative_eq!(gap, 25.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn spurious_candidates_are_filtered_out() {
        let mut candidates = lattice_candidates(5, 4, 30.0, 0.0);
        // An off-lattice extra inside one row; the uniform-run selection must
        // drop it.
        candidates.push(Candidate {
            position: Point2::new(100.0 + 4.0 * 30.0 + 55.0, 80.0),
            response: 0.9,
        });
        let grid = order_into_grid(&candidates, 5, 4).expect("grid");
        assert_eq!(grid.len(), 20);
        assert!(grid.iter().all(|p| p.x <= 220.0 + 1e-9));
    }

    #[test]
    fn too_few_candidates_fail() {
        let candidates = lattice_candidates(5, 4, 30.0, 0.0);
        assert!(order_into_grid(&candidates[..15], 5, 4).is_none());
    }

    #[test]
    fn random_scatter_fails_validation() {
        // Points on a strongly non-uniform layout.
        let positions = [
            (10.0, 10.0),
            (14.0, 90.0),
            (300.0, 12.0),
            (180.0, 230.0),
            (44.0, 160.0),
            (260.0, 140.0),
            (90.0, 270.0),
            (210.0, 60.0),
        ];
        let candidates: Vec<Candidate> = positions
            .iter()
            .map(|&(x, y)| Candidate {
                position: Point2::new(x, y),
                response: 1.0,
            })
            .collect();
        assert!(order_into_grid(&candidates, 4, 2).is_none());
    }
}

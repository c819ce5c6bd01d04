//! Pairing of detected reseau marks with their nominal positions.

use kd_tree::{KdPoint, KdTree};

use crate::tie_point::TiePoint;

/// A detected mark, indexed by its position in the detection list.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Mark {
    sample: f64,
    line: f64,
    index: usize,
}

impl KdPoint for Mark {
    type Scalar = f64;
    type Dim = typenum::U2;
    fn at(&self, k: usize) -> f64 {
        if k == 0 {
            self.sample
        } else {
            self.line
        }
    }
}

/// Builds one tie point per nominal mark position.
///
/// `nominal` holds the reference (output) coordinates of the marks and
/// `detected` the marks found in the input raster. Each nominal position is
/// paired with its nearest detection; a detection claimed by several nominal
/// positions goes to the closest one. Nominal positions left without a
/// detection within `max_distance` produce an ignored tie point at the
/// nominal position, so the result stays aligned with `nominal`.
///
/// # Examples
/// ```
/// # use coreg::mark_matcher::pair_marks;
/// let nominal = [(10.0, 10.0), (50.0, 10.0)];
/// let detected = [(50.8, 9.5), (10.4, 10.3)];
/// let points = pair_marks(&nominal, &detected, 2.0);
/// assert_eq!(points[0].input(), (10.4, 10.3));
/// assert_eq!(points[1].input(), (50.8, 9.5));
/// assert!(points.iter().all(|p| !p.ignored));
/// ```
pub fn pair_marks(nominal: &[(f64, f64)], detected: &[(f64, f64)], max_distance: f64) -> Vec<TiePoint> {
    let unmatched = |&(s, l): &(f64, f64)| TiePoint::new(s, l, s, l).ignore();
    if detected.is_empty() {
        return nominal.iter().map(unmatched).collect();
    }

    let marks: Vec<Mark> = detected
        .iter()
        .enumerate()
        .map(|(index, &(sample, line))| Mark { sample, line, index })
        .collect();
    let kdtree = KdTree::build_by_ordered_float(marks);

    let mut candidates: Vec<(f64, usize, usize)> = Vec::new();
    for (n, &(sample, line)) in nominal.iter().enumerate() {
        let query = Mark { sample, line, index: n };
        if let Some(found) = kdtree.nearest(&query) {
            let distance = found.squared_distance.sqrt();
            if distance <= max_distance {
                candidates.push((distance, n, found.item.index));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut points: Vec<TiePoint> = nominal.iter().map(unmatched).collect();
    let mut claimed = vec![false; detected.len()];
    for (_, n, d) in candidates {
        if claimed[d] {
            continue;
        }
        claimed[d] = true;
        let (in_sample, in_line) = detected[d];
        let (out_sample, out_line) = nominal[n];
        points[n] = TiePoint::new(in_sample, in_line, out_sample, out_line);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_each_nominal_with_nearest_detection() {
        let nominal = [(10.0, 10.0), (30.0, 10.0), (10.0, 30.0), (30.0, 30.0)];
        let detected = [(30.5, 30.2), (9.6, 10.1), (10.2, 29.7), (29.9, 10.4)];
        let points = pair_marks(&nominal, &detected, 1.5);
        assert_eq!(points.len(), 4);
        assert_eq!(points[0], TiePoint::new(9.6, 10.1, 10.0, 10.0));
        assert_eq!(points[1], TiePoint::new(29.9, 10.4, 30.0, 10.0));
        assert_eq!(points[2], TiePoint::new(10.2, 29.7, 10.0, 30.0));
        assert_eq!(points[3], TiePoint::new(30.5, 30.2, 30.0, 30.0));
    }

    #[test]
    fn distant_detections_leave_mark_ignored() {
        let nominal = [(10.0, 10.0), (30.0, 10.0)];
        let detected = [(10.3, 10.0), (34.0, 10.0)];
        let points = pair_marks(&nominal, &detected, 2.0);
        assert!(!points[0].ignored);
        assert!(points[1].ignored);
        assert_eq!(points[1].input(), (30.0, 10.0));
    }

    #[test]
    fn shared_detection_goes_to_closest_mark() {
        let nominal = [(10.0, 10.0), (12.0, 10.0)];
        let detected = [(11.6, 10.0)];
        let points = pair_marks(&nominal, &detected, 3.0);
        assert!(points[0].ignored);
        assert_eq!(points[1].input(), (11.6, 10.0));
    }

    #[test]
    fn no_detections() {
        let points = pair_marks(&[(1.0, 2.0)], &[], 5.0);
        assert_eq!(points.len(), 1);
        assert!(points[0].ignored);
    }
}

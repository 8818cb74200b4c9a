//! Trajectory simplification to dominant points.
//!
//! Douglas-Peucker keeps every vertex needed so that no discarded point lies
//! further than `max_deviation` from its retained segment. A second pass
//! merges retained vertices closer than `min_segment_length` to the previously
//! kept one; the first and last points of the path are always kept.

use nalgebra::Vector2;

/// Dominant points and their indices into the original path.
#[derive(Debug, Clone)]
pub struct DominantPoints {
    pub points: Vec<Vector2<f64>>,
    pub indices: Vec<usize>,
}

impl DominantPoints {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Distance from `p` to the segment `[a, b]`.
pub fn segment_distance(p: &Vector2<f64>, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
    let ab = b - a;
    let len_sq = ab.norm_squared();
    if len_sq < 1e-20 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len_sq).clamp(0.0, 1.0);
    (p - (a + t * ab)).norm()
}

fn douglas_peucker(path: &[Vector2<f64>], max_deviation: f64) -> Vec<usize> {
    let n = path.len();
    if n < 3 {
        return (0..n).collect();
    }
    let mut keep = vec![false; n];
    keep[0] = true;
    keep[n - 1] = true;

    let mut stack = vec![(0, n - 1)];
    while let Some((start, end)) = stack.pop() {
        if end <= start + 1 {
            continue;
        }
        let (mut max_dist, mut max_idx) = (0.0, start);
        for i in start + 1..end {
            let dist = segment_distance(&path[i], &path[start], &path[end]);
            if dist > max_dist {
                max_dist = dist;
                max_idx = i;
            }
        }
        if max_dist > max_deviation {
            keep[max_idx] = true;
            stack.push((start, max_idx));
            stack.push((max_idx, end));
        }
    }
    (0..n).filter(|&i| keep[i]).collect()
}

/// Reduces `path` to its dominant points.
pub fn simplify(path: &[Vector2<f64>], max_deviation: f64, min_segment_length: f64) -> DominantPoints {
    let candidates = douglas_peucker(path, max_deviation);

    let mut indices: Vec<usize> = Vec::with_capacity(candidates.len());
    for &idx in &candidates {
        match indices.last() {
            Some(&prev) if (path[idx] - path[prev]).norm() < min_segment_length => {}
            _ => indices.push(idx),
        }
    }

    // the path end always survives, displacing a too close predecessor
    let last = path.len().saturating_sub(1);
    if !path.is_empty() && indices.last() != Some(&last) {
        while indices.len() > 1 {
            let prev = indices[indices.len() - 1];
            if (path[last] - path[prev]).norm() >= min_segment_length {
                break;
            }
            indices.pop();
        }
        indices.push(last);
    }

    DominantPoints {
        points: indices.iter().map(|&i| path[i]).collect(),
        indices,
    }
}

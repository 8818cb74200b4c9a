//! Point-to-point ICP between two small 2D point sets.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::{Isometry2, Point2, UnitComplex, Vector2};

/// Leaf size of the model tree; straight windows put every point on one axis value.
const BUCKET_SIZE: usize = 256;
const MAX_ITERATIONS: usize = 50;
/// Fraction of the farthest correspondences left out of every update.
const OUTLIER_RATIO: f64 = 0.1;
const TRANSLATION_EPSILON: f64 = 1e-9;
const ROTATION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Alignment {
    /// Maps test points onto the model.
    pub transform: Isometry2<f64>,
    /// Mean squared nearest-neighbour distance of all test points after alignment.
    pub residual: f64,
    pub iterations: usize,
}

type ModelTree = ImmutableKdTree<f64, u64, 2, BUCKET_SIZE>;

/// Item `i` of the tree is `model[i]`.
fn build_kdtree(model: &[Point2<f64>]) -> ModelTree {
    let coords: Vec<[f64; 2]> = model.iter().map(|p| [p.x, p.y]).collect();
    (&*coords).into()
}

/// Index of the closest model point and its squared distance.
fn nearest(tree: &ModelTree, p: &Point2<f64>) -> (usize, f64) {
    let nn = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y]);
    (nn.item as usize, nn.distance)
}

fn mean_squared_distance(tree: &ModelTree, test: &[Point2<f64>], transform: &Isometry2<f64>) -> f64 {
    test.iter()
        .map(|p| nearest(tree, &(transform * p)).1)
        .sum::<f64>()
        / test.len() as f64
}

/// Aligns `test` onto `model` starting from `initial_guess`.
///
/// Each update ignores the farthest tenth of the correspondences, so test
/// points past the end of the model do not drag the fit.
///
/// Returns `None` when either point set is empty.
pub fn align(
    model: &[Point2<f64>],
    test: &[Point2<f64>],
    initial_guess: Isometry2<f64>,
) -> Option<Alignment> {
    if model.is_empty() || test.is_empty() {
        return None;
    }
    let tree = build_kdtree(model);
    let keep = (test.len() - (test.len() as f64 * OUTLIER_RATIO) as usize).max(1);
    let n = keep as f64;
    let mut transform = initial_guess;
    let mut iterations = 0;

    for _ in 0..MAX_ITERATIONS {
        iterations += 1;
        let mut pairs: Vec<(f64, Point2<f64>, Point2<f64>)> = test
            .iter()
            .map(|p| {
                let moved = transform * p;
                let (index, distance) = nearest(&tree, &moved);
                (distance, moved, model[index])
            })
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        pairs.truncate(keep);

        let source_centroid = pairs.iter().fold(Vector2::zeros(), |acc, (_, s, _)| acc + s.coords) / n;
        let target_centroid = pairs.iter().fold(Vector2::zeros(), |acc, (_, _, t)| acc + t.coords) / n;

        // cross-covariance, theta = atan2(h01 - h10, h00 + h11)
        let (mut h00, mut h01, mut h10, mut h11) = (0.0, 0.0, 0.0, 0.0);
        for (_, s, t) in &pairs {
            let s = s.coords - source_centroid;
            let t = t.coords - target_centroid;
            h00 += s.x * t.x;
            h01 += s.x * t.y;
            h10 += s.y * t.x;
            h11 += s.y * t.y;
        }
        let dtheta = f64::atan2(h01 - h10, h00 + h11);
        let rotation = UnitComplex::new(dtheta);
        let dt = target_centroid - rotation * source_centroid;
        let step = Isometry2::from_parts(dt.into(), rotation);

        transform = step * transform;
        if dt.norm() < TRANSLATION_EPSILON && dtheta.abs() < ROTATION_EPSILON {
            break;
        }
    }

    Some(Alignment {
        residual: mean_squared_distance(&tree, test, &transform),
        transform,
        iterations,
    })
}

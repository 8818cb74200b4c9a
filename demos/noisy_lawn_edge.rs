// Lawn edge mapping sample
//
// A mower follows the edge of an L-shaped lawn for three laps. Its odometry
// drifts, so the dead-reckoned path does not close. The mapping run detects
// the revisited corners, closes the loop and estimates the edge length.

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::error::Error;

use boundary_mapping::config::DetectorParameters;
use boundary_mapping::data::{write_polygon, write_poses};
use boundary_mapping::{run_mapping, HyperparameterSet, MappingOptions};

const STEP: f64 = 0.1;
const LAPS: usize = 3;

/// Ground-truth edge of the lawn, counter clockwise.
fn lawn_edge() -> Vec<Vector2<f64>> {
    vec![
        Vector2::new(0.0, 0.0),
        Vector2::new(12.0, 0.0),
        Vector2::new(12.0, 5.0),
        Vector2::new(6.0, 5.0),
        Vector2::new(6.0, 9.0),
        Vector2::new(0.0, 9.0),
    ]
}

/// Points every `STEP` along `LAPS` laps of the edge.
fn ground_truth() -> Vec<Vector2<f64>> {
    let edge = lawn_edge();
    let mut path = Vec::new();
    for _ in 0..LAPS {
        for (k, a) in edge.iter().enumerate() {
            let b = edge[(k + 1) % edge.len()];
            let n = ((b - a).norm() / STEP).round() as usize;
            for i in 0..n {
                path.push(a + (b - a) * (i as f64 / n as f64));
            }
        }
    }
    path.push(edge[0]);
    path
}

/// Dead reckoning of the ground truth with noisy, slightly biased odometry.
fn dead_reckoning(truth: &[Vector2<f64>], rng: &mut StdRng) -> Vec<Vector2<f64>> {
    let distance_noise = Normal::new(1.0, 0.01).unwrap();
    let heading_noise = Normal::new(0.0005, 0.002).unwrap();

    let mut path = vec![truth[0]];
    let mut position = truth[0];
    let mut heading = 0.0;
    let mut true_heading = 0.0;
    for w in truth.windows(2) {
        let d = w[1] - w[0];
        let direction = f64::atan2(d.y, d.x);
        heading += boundary_mapping::utils::normalize_angle(direction - true_heading) + heading_noise.sample(rng);
        true_heading = direction;
        let distance = d.norm() * distance_noise.sample(rng);
        position += distance * Vector2::new(heading.cos(), heading.sin());
        path.push(position);
    }
    path
}

fn main() -> Result<(), Box<dyn Error>> {
    // Create output directory if it didnt exist
    std::fs::create_dir_all("./out")?;

    let mut rng = StdRng::seed_from_u64(7);
    let truth = ground_truth();
    let odometry_path = dead_reckoning(&truth, &mut rng);
    let drift = (odometry_path[odometry_path.len() - 1] - truth[truth.len() - 1]).norm();
    println!("{} path points, final dead-reckoning drift {drift:.2} m", odometry_path.len());

    let mut params = HyperparameterSet::default();
    params.simplification.max_deviation = 0.3;
    params.simplification.min_segment_length = 1.0;
    params.detector = DetectorParameters {
        neighborhood_length: 2.5,
        max_dissimilarity: 0.1,
        cycle_break_angle: 2.0,
        samples: 31,
    };
    let options = MappingOptions {
        calibrate_detector: true,
        calibrate_solver: true,
        calibration_budget: 20,
        ..Default::default()
    };

    let output = run_mapping(&odometry_path, params, &options)?;
    println!(
        "{} dominant points, {} loop closures, {:?} after {} iterations",
        output.dominant_points.len(),
        output.closures.len(),
        output.report.termination_reason,
        output.report.iterations
    );
    let true_length: f64 = lawn_edge()
        .iter()
        .zip(lawn_edge().iter().cycle().skip(1))
        .map(|(a, b)| (b - a).norm())
        .sum();
    match &output.circumference {
        Some(estimate) => println!(
            "edge length {:.2} m (true {true_length:.2} m)",
            estimate.circumference
        ),
        None => println!("not enough loop closures to estimate the edge length"),
    }
    println!("calibrated hyperparameters:\n{}", toml::to_string_pretty(&output.hyperparameters)?);

    write_poses("./out/noisy_lawn_edge_poses.csv", output.poses())?;
    write_polygon("./out/noisy_lawn_edge_polygon.csv", &output.polygon)?;
    Ok(())
}
